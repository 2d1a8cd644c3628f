//! Wave planning: layers the dependency graph into sequential batches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use super::DependencyGraph;

/// A batch of tables with no dependencies on each other, migrated concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 1-based position in the plan.
    pub number: usize,

    /// Tables in this wave (no ordering guarantee when executed).
    pub tables: BTreeSet<String>,
}

impl Wave {
    pub fn new<I, S>(number: usize, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            number,
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

/// Group tables into waves so every table follows the tables it references.
///
/// Each round takes every remaining table whose dependencies have all been
/// placed. When no table qualifies, the remaining tables form a cycle: the
/// lexicographically smallest one is forced into a wave of its own, which
/// guarantees progress but not that its references exist when it loads.
pub fn plan_waves(graph: &DependencyGraph) -> Vec<Wave> {
    let mut remaining: BTreeSet<&str> = graph.names().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let mut ready: BTreeSet<String> = remaining
            .iter()
            .filter(|name| graph.dependencies_of(name).all(|dep| !remaining.contains(dep)))
            .map(|name| name.to_string())
            .collect();

        if ready.is_empty() {
            if let Some(forced) = remaining.first() {
                let blocked_by: Vec<&str> = graph
                    .dependencies_of(forced)
                    .filter(|dep| remaining.contains(dep))
                    .collect();
                warn!(
                    "Dependency cycle detected: placing {} alone in wave {} (still waiting on {})",
                    forced,
                    waves.len() + 1,
                    blocked_by.join(", ")
                );
                ready.insert(forced.to_string());
            }
        }

        for name in &ready {
            remaining.remove(name.as_str());
        }

        let wave = Wave {
            number: waves.len() + 1,
            tables: ready,
        };
        debug!("Wave {}: {:?}", wave.number, wave.tables);
        waves.push(wave);
    }

    waves
}
