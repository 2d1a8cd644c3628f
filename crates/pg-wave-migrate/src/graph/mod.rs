//! Foreign-key dependency graph and wave planning.
//!
//! - [`DependencyGraph`]: which tables each table references
//! - [`plan_waves`]: layers the graph into sequential [`Wave`]s

mod waves;

pub use waves::{plan_waves, Wave};

use std::collections::{BTreeMap, BTreeSet};

/// A table eligible for migration and the tables it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Table name (case-sensitive, unique within a run).
    pub name: String,

    /// Referenced tables, restricted to the eligible set.
    pub dependencies: BTreeSet<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
        }
    }
}

/// Mapping from table name to [`Table`], built once and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    tables: BTreeMap<String, Table>,
}

impl DependencyGraph {
    /// Build a graph from the eligible table names and a foreign-key lookup.
    ///
    /// `edges_of` is called exactly once per table. Referenced names outside
    /// the eligible set are dropped, as are self-references: a table's rows
    /// travel together, so a self-referencing key never orders it.
    pub fn build<N, S, F, D, E>(names: N, mut edges_of: F) -> Result<Self, E>
    where
        N: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(&str) -> Result<D, E>,
        D: IntoIterator<Item = String>,
    {
        let mut tables: BTreeMap<String, Table> = names
            .into_iter()
            .map(|name| {
                let name: String = name.into();
                (name.clone(), Table::new(name))
            })
            .collect();

        let eligible: BTreeSet<String> = tables.keys().cloned().collect();

        for (name, table) in tables.iter_mut() {
            table.dependencies = edges_of(name)?
                .into_iter()
                .filter(|dep| dep != name && eligible.contains(dep))
                .collect();
        }

        Ok(Self { tables })
    }

    /// Build a graph from explicit `(table, referenced_table)` edges.
    pub fn from_edges<N, S, I>(names: N, edges: I) -> Self
    where
        N: IntoIterator<Item = S>,
        S: Into<String>,
        I: IntoIterator<Item = (String, String)>,
    {
        let mut lookup: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (from, to) in edges {
            lookup.entry(from).or_default().push(to);
        }
        let built: Result<Self, std::convert::Infallible> =
            Self::build(names, |name| Ok(lookup.remove(name).unwrap_or_default()));
        match built {
            Ok(graph) => graph,
            Err(never) => match never {},
        }
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Table names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Dependencies of `name`; empty for unknown tables.
    pub fn dependencies_of<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.tables
            .get(name)
            .into_iter()
            .flat_map(|t| t.dependencies.iter().map(String::as_str))
    }

    /// Total number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.tables.values().map(|t| t.dependencies.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: &str, to: &str) -> (String, String) {
        (from.to_string(), to.to_string())
    }

    #[test]
    fn test_build_keeps_only_eligible_dependencies() {
        let graph = DependencyGraph::from_edges(
            ["users", "orders"],
            [edge("orders", "users"), edge("orders", "users_backup_2024")],
        );

        let orders = graph.get("orders").unwrap();
        assert_eq!(
            orders.dependencies.iter().collect::<Vec<_>>(),
            vec!["users"]
        );
        assert!(graph.get("users").unwrap().dependencies.is_empty());
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_build_drops_self_reference() {
        let graph = DependencyGraph::from_edges(
            ["employees"],
            [edge("employees", "employees")],
        );
        assert!(graph.get("employees").unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let graph = DependencyGraph::from_edges(["Users", "orders"], [edge("orders", "users")]);
        assert!(graph.contains("Users"));
        assert!(!graph.contains("users"));
        assert_eq!(graph.dependencies_of("orders").count(), 0);
    }

    #[test]
    fn test_build_calls_lookup_once_per_table() {
        let mut calls = Vec::new();
        let graph: Result<DependencyGraph, ()> =
            DependencyGraph::build(["a", "b", "c"], |name| {
                calls.push(name.to_string());
                Ok(Vec::<String>::new())
            });
        assert_eq!(graph.unwrap().len(), 3);
        calls.sort();
        assert_eq!(calls, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_build_propagates_lookup_error() {
        let graph: Result<DependencyGraph, String> = DependencyGraph::build(["a", "b"], |name| {
            if name == "b" {
                Err(format!("lookup failed for {}", name))
            } else {
                Ok(Vec::<String>::new())
            }
        });
        assert_eq!(graph.unwrap_err(), "lookup failed for b");
    }

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::from_edges(Vec::<String>::new(), Vec::new());
        assert!(graph.is_empty());
        assert_eq!(graph.names().count(), 0);
    }
}
