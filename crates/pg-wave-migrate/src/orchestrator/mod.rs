//! Migration orchestrator - main workflow coordinator.

mod executor;

pub use executor::{ExecutorConfig, WaveExecutor, WaveReport};

use crate::config::{Config, EndpointConfig};
use crate::error::{MigrateError, Result};
use crate::graph::{plan_waves, DependencyGraph, Wave};
use crate::source::{MetadataSource, PgCatalog};
use crate::state::MigrationState;
use crate::transfer::{DumpRestoreMigrator, JobCause, JobError, PgTools, TableMigrator, ToolError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn MetadataSource>,
    target: Arc<dyn MetadataSource>,
    executor: WaveExecutor,
    state_file: Option<PathBuf>,
    state: Option<MigrationState>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: "completed" or "dry_run".
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Tables in the plan.
    pub tables_total: usize,

    /// Tables migrated by this run.
    pub tables_migrated: usize,

    /// Tables skipped because a previous run already migrated them.
    pub tables_skipped: usize,

    /// Waves in the plan.
    pub waves_total: usize,

    /// Waves that finished successfully.
    pub waves_completed: usize,

    /// The wave plan.
    pub waves: Vec<Wave>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Progress of a run: which wave is executing and whether any wave failed.
///
/// The failed flag is a latch; once set it stays set for the rest of the run.
#[derive(Debug)]
pub struct RunProgress {
    current_wave: usize,
    started: Instant,
    failed: bool,
}

impl RunProgress {
    pub fn new() -> Self {
        Self {
            current_wave: 0,
            started: Instant::now(),
            failed: false,
        }
    }

    pub fn enter_wave(&mut self, number: usize) {
        self.current_wave = number;
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn current_wave(&self) -> usize {
        self.current_wave
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Connectivity of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of [`health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source: EndpointHealth,
    pub target: EndpointHealth,
}

/// Which source tables exist on the target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub present: Vec<String>,
    pub missing: Vec<String>,
}

impl ValidationReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl Orchestrator {
    /// Connect to both endpoints and set up the dump/restore pipeline.
    pub async fn new(config: Config) -> Result<Self> {
        let source = connect_catalog("source", &config.source, &config).await?;
        let target = connect_catalog("target", &config.target, &config).await?;

        let tools = PgTools::new(&config.tools, &config.source, &config.target);
        let migrator = DumpRestoreMigrator::new(tools, config.migration.schema.clone())?;

        Ok(Self::with_components(
            config,
            Arc::new(source),
            Arc::new(target),
            Arc::new(migrator),
        ))
    }

    /// Assemble an orchestrator from already-built parts.
    pub fn with_components(
        config: Config,
        source: Arc<dyn MetadataSource>,
        target: Arc<dyn MetadataSource>,
        migrator: Arc<dyn TableMigrator>,
    ) -> Self {
        let executor = WaveExecutor::new(migrator, ExecutorConfig::from(&config.migration));
        Self {
            config,
            source,
            target,
            executor,
            state_file: None,
            state: None,
        }
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        if let Some(ref path) = self.state_file {
            if path.exists() {
                let state = MigrationState::load(path)?;
                state.validate_config(&self.config.hash())?;
                info!(
                    "Resuming run {} from state file: {:?} ({} table(s) already migrated)",
                    state.run_id,
                    path,
                    state.completed_tables().count()
                );
                self.state = Some(state);
            }
        }
        Ok(self)
    }

    /// Discover tables and plan waves without running anything.
    pub async fn plan(&self) -> Result<Vec<Wave>> {
        let graph = discover_graph(self.source.as_ref()).await?;
        let waves = plan_waves(&graph);
        log_plan(&waves);
        Ok(waves)
    }

    /// Run the migration.
    ///
    /// Waves execute strictly in order. The first failed wave stops the run
    /// with [`MigrateError::WaveFailed`]; later waves never start.
    pub async fn run(mut self, cancel: CancellationToken, dry_run: bool) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let mut progress = RunProgress::new();
        let run_id = self
            .state
            .as_ref()
            .map(|s| s.run_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        info!("Starting migration run: {}", run_id);
        info!(
            "Source: {}, target: {}",
            self.source.describe(),
            self.target.describe()
        );

        let waves = self.plan().await?;
        let tables_total: usize = waves.iter().map(Wave::len).sum();

        if dry_run {
            info!("Dry run: no tables migrated");
            return Ok(MigrationResult {
                run_id,
                status: "dry_run".to_string(),
                duration_seconds: progress.elapsed().as_secs_f64(),
                started_at,
                completed_at: Utc::now(),
                tables_total,
                tables_migrated: 0,
                tables_skipped: 0,
                waves_total: waves.len(),
                waves_completed: 0,
                waves,
            });
        }

        let mut state = self
            .state
            .take()
            .unwrap_or_else(|| MigrationState::new(run_id.clone(), self.config.hash()));
        state.reopen();
        state.record_plan(&waves);
        self.save_state(&mut state)?;

        let mut tables_migrated = 0;
        let mut tables_skipped = 0;
        let mut waves_completed = 0;

        for wave in &waves {
            if cancel.is_cancelled() {
                return self.abort_cancelled(&mut state);
            }
            progress.enter_wave(wave.number);

            let pending: BTreeSet<String> = wave
                .tables
                .iter()
                .filter(|t| !state.is_table_completed(t))
                .cloned()
                .collect();
            tables_skipped += wave.len() - pending.len();

            if pending.is_empty() {
                info!("Wave {}: all tables already migrated, skipping", wave.number);
                waves_completed += 1;
                continue;
            }

            for table in &pending {
                state.get_or_create_table(table, wave.number).mark_in_progress();
            }
            self.save_state(&mut state)?;

            let report = self
                .executor
                .execute(&Wave::new(wave.number, pending), &cancel)
                .await;

            for table in &report.completed {
                state.get_or_create_table(table, wave.number).mark_completed();
            }
            for failure in &report.failures {
                state
                    .get_or_create_table(&failure.table, wave.number)
                    .mark_failed(&failure.to_string());
            }
            for table in &report.unfinished {
                state
                    .get_or_create_table(table, wave.number)
                    .mark_failed("wave timed out before the job finished");
            }
            tables_migrated += report.completed.len();

            if !report.is_success() {
                progress.mark_failed();
                for failure in &report.failures {
                    log_failure(failure);
                }

                if cancel.is_cancelled() {
                    return self.abort_cancelled(&mut state);
                }

                state.mark_failed();
                self.save_state(&mut state)?;
                error!(
                    "Wave {} of {} failed; stopping after {:.2?}",
                    progress.current_wave(),
                    waves.len(),
                    progress.elapsed()
                );
                return Err(MigrateError::WaveFailed {
                    wave: wave.number,
                    reason: report.failure_reason(),
                    failed_tables: report.failed_tables(),
                });
            }

            waves_completed += 1;
            self.save_state(&mut state)?;
        }

        state.mark_completed();
        self.save_state(&mut state)?;

        let duration = progress.elapsed();
        info!(
            "Migration completed in {:.2?}: {} table(s) migrated, {} skipped, {} wave(s)",
            duration,
            tables_migrated,
            tables_skipped,
            waves.len()
        );

        Ok(MigrationResult {
            run_id,
            status: "completed".to_string(),
            duration_seconds: duration.as_secs_f64(),
            started_at,
            completed_at: Utc::now(),
            tables_total,
            tables_migrated,
            tables_skipped,
            waves_total: waves.len(),
            waves_completed,
            waves,
        })
    }

    /// Report which eligible source tables exist on the target.
    pub async fn validate(&self) -> Result<ValidationReport> {
        let tables = self
            .source
            .list_eligible_tables()
            .await
            .map_err(into_metadata)?;
        let mut report = ValidationReport::default();

        for table in tables {
            if self.target.table_exists(&table).await.map_err(into_metadata)? {
                debug!("{}: present on target", table);
                report.present.push(table);
            } else {
                warn!("{}: missing on target", table);
                report.missing.push(table);
            }
        }

        info!(
            "Validation: {} present, {} missing",
            report.present.len(),
            report.missing.len()
        );
        Ok(report)
    }

    fn abort_cancelled(&self, state: &mut MigrationState) -> Result<MigrationResult> {
        warn!("Migration cancelled");
        state.mark_cancelled();
        self.save_state(state)?;
        Err(MigrateError::Cancelled)
    }

    /// Save state to file.
    fn save_state(&self, state: &mut MigrationState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}

/// Build the dependency graph from a catalog: list eligible tables, then
/// look up foreign keys once per table.
pub async fn discover_graph(source: &dyn MetadataSource) -> Result<DependencyGraph> {
    let names = source.list_eligible_tables().await.map_err(into_metadata)?;

    let mut references: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &names {
        let refs = source.foreign_keys_of(name).await.map_err(into_metadata)?;
        references.insert(name.clone(), refs);
    }

    let graph = DependencyGraph::build(names, |name| {
        Ok::<_, MigrateError>(references.remove(name).unwrap_or_default())
    })?;
    info!(
        "Discovered {} table(s) with {} foreign-key dependencies",
        graph.len(),
        graph.edge_count()
    );
    Ok(graph)
}

/// Connect to both endpoints and measure how long each takes to answer.
pub async fn health_check(config: &Config) -> HealthCheckResult {
    let source = probe("source", &config.source, config).await;
    let target = probe("target", &config.target, config).await;
    HealthCheckResult {
        healthy: source.connected && target.connected,
        source,
        target,
    }
}

async fn probe(role: &str, endpoint: &EndpointConfig, config: &Config) -> EndpointHealth {
    let start = Instant::now();
    let outcome = async {
        let catalog = connect_catalog(role, endpoint, config).await?;
        catalog.test_connection().await?;
        Ok::<_, MigrateError>(catalog.describe())
    }
    .await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(description) => EndpointHealth {
            connected: true,
            latency_ms,
            description: Some(description),
            error: None,
        },
        Err(e) => EndpointHealth {
            connected: false,
            latency_ms,
            description: None,
            error: Some(e.to_string()),
        },
    }
}

async fn connect_catalog(role: &str, endpoint: &EndpointConfig, config: &Config) -> Result<PgCatalog> {
    PgCatalog::connect(
        role,
        endpoint,
        &config.migration.schema,
        &config.migration.exclude_tables,
        config.migration.get_max_catalog_connections(),
    )
    .await
}

fn into_metadata(e: MigrateError) -> MigrateError {
    match e {
        MigrateError::Metadata(_) | MigrateError::Cancelled => e,
        other => MigrateError::Metadata(other.to_string()),
    }
}

fn log_plan(waves: &[Wave]) {
    let tables: usize = waves.iter().map(Wave::len).sum();
    info!("Planned {} table(s) in {} wave(s)", tables, waves.len());
    for wave in waves {
        info!(
            "  Wave {}: {}",
            wave.number,
            wave.tables.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
}

fn log_failure(failure: &JobError) {
    error!("{}", failure);
    if let JobCause::Tool(ToolError::Exit { stdout, .. }) = &failure.cause {
        if !stdout.is_empty() {
            error!("{} {} output: {}", failure.table, failure.stage, stdout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunStatus, TaskStatus};
    use crate::transfer::Stage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCatalog {
        tables: Vec<String>,
        references: BTreeMap<String, Vec<String>>,
        existing: BTreeSet<String>,
        fail_lookup: Option<String>,
        lookups: AtomicUsize,
    }

    impl FakeCatalog {
        fn with_tables(tables: &[&str]) -> Self {
            Self {
                tables: tables.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            }
        }

        fn referencing(mut self, table: &str, refs: &[&str]) -> Self {
            self.references
                .insert(table.to_string(), refs.iter().map(|r| r.to_string()).collect());
            self
        }
    }

    #[async_trait]
    impl MetadataSource for FakeCatalog {
        async fn list_eligible_tables(&self) -> Result<Vec<String>> {
            Ok(self.tables.clone())
        }

        async fn foreign_keys_of(&self, table: &str) -> Result<Vec<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail_lookup.as_deref() == Some(table) {
                return Err(MigrateError::pool("connection reset", "foreign_keys_of"));
            }
            Ok(self.references.get(table).cloned().unwrap_or_default())
        }

        async fn table_exists(&self, table: &str) -> Result<bool> {
            Ok(self.existing.contains(table))
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            "fake:5432/app".to_string()
        }
    }

    #[derive(Default)]
    struct RecordingMigrator {
        failing: BTreeSet<String>,
        migrated: Mutex<Vec<String>>,
    }

    impl RecordingMigrator {
        fn failing(tables: &[&str]) -> Self {
            Self {
                failing: tables.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            }
        }

        fn migrated(&self) -> Vec<String> {
            self.migrated.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TableMigrator for RecordingMigrator {
        async fn migrate_table(&self, table: &str, _cancel: &CancellationToken) -> std::result::Result<(), JobError> {
            self.migrated.lock().unwrap().push(table.to_string());
            if self.failing.contains(table) {
                return Err(JobError::new(
                    table,
                    Stage::Dump,
                    ToolError::Exit {
                        program: "pg_dump".into(),
                        status: "exit status: 1".into(),
                        stdout: String::new(),
                        stderr: "pg_dump: error: query failed".into(),
                    },
                ));
            }
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.source = EndpointConfig::new("postgresql://reader@source/app");
        config.target = EndpointConfig::new("postgresql://writer@target/app");
        config.migration.launch_delay_ms = Some(0);
        config
    }

    /// users <- orders <- line_items, plus an independent products table.
    fn shop_catalog() -> FakeCatalog {
        FakeCatalog::with_tables(&["users", "orders", "line_items", "products"])
            .referencing("orders", &["users"])
            .referencing("line_items", &["orders", "products"])
    }

    fn orchestrator(
        source: FakeCatalog,
        target: FakeCatalog,
        migrator: &Arc<RecordingMigrator>,
    ) -> Orchestrator {
        let migrator: Arc<dyn TableMigrator> = migrator.clone();
        Orchestrator::with_components(test_config(), Arc::new(source), Arc::new(target), migrator)
    }

    fn position(order: &[String], table: &str) -> usize {
        order.iter().position(|t| t == table).unwrap()
    }

    #[tokio::test]
    async fn test_run_migrates_waves_in_order() {
        let migrator = Arc::new(RecordingMigrator::default());
        let orch = orchestrator(shop_catalog(), FakeCatalog::default(), &migrator);

        let result = orch.run(CancellationToken::new(), false).await.unwrap();

        assert_eq!(result.status, "completed");
        assert_eq!(result.tables_total, 4);
        assert_eq!(result.tables_migrated, 4);
        assert_eq!(result.waves_total, 3);
        assert_eq!(result.waves_completed, 3);
        assert_eq!(result.waves[0], Wave::new(1, ["products", "users"]));

        let order = migrator.migrated();
        assert!(position(&order, "users") < position(&order, "orders"));
        assert!(position(&order, "orders") < position(&order, "line_items"));
        assert!(position(&order, "products") < position(&order, "line_items"));
    }

    #[tokio::test]
    async fn test_failed_wave_stops_the_run() {
        let migrator = Arc::new(RecordingMigrator::failing(&["users"]));
        let orch = orchestrator(shop_catalog(), FakeCatalog::default(), &migrator);

        let err = orch.run(CancellationToken::new(), false).await.unwrap_err();

        match &err {
            MigrateError::WaveFailed {
                wave,
                reason,
                failed_tables,
            } => {
                assert_eq!(*wave, 1);
                assert_eq!(failed_tables, &vec!["users".to_string()]);
                assert!(reason.contains("query failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_code(), 4);

        // The sibling in wave 1 still ran; nothing from wave 2 did.
        let order = migrator.migrated();
        assert!(order.contains(&"products".to_string()));
        assert!(!order.contains(&"orders".to_string()));
        assert!(!order.contains(&"line_items".to_string()));
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let migrator = Arc::new(RecordingMigrator::default());
        let orch = orchestrator(shop_catalog(), FakeCatalog::default(), &migrator);

        let result = orch.run(CancellationToken::new(), true).await.unwrap();

        assert_eq!(result.status, "dry_run");
        assert_eq!(result.waves_total, 3);
        assert_eq!(result.tables_migrated, 0);
        assert!(migrator.migrated().is_empty());
        assert!(result.to_json().unwrap().contains("\"dry_run\""));
    }

    #[tokio::test]
    async fn test_empty_schema_completes_with_no_waves() {
        let migrator = Arc::new(RecordingMigrator::default());
        let orch = orchestrator(FakeCatalog::default(), FakeCatalog::default(), &migrator);

        let result = orch.run(CancellationToken::new(), false).await.unwrap();
        assert_eq!(result.waves_total, 0);
        assert_eq!(result.tables_total, 0);
    }

    #[tokio::test]
    async fn test_discovery_looks_up_each_table_once() {
        let catalog = shop_catalog();
        let graph = discover_graph(&catalog).await.unwrap();

        assert_eq!(catalog.lookups.load(Ordering::SeqCst), 4);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.edge_count(), 3);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_metadata_error() {
        let mut catalog = shop_catalog();
        catalog.fail_lookup = Some("orders".to_string());

        let err = discover_graph(&catalog).await.unwrap_err();
        assert!(matches!(err, MigrateError::Metadata(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancellation() {
        let migrator = Arc::new(RecordingMigrator::default());
        let orch = orchestrator(shop_catalog(), FakeCatalog::default(), &migrator);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.run(cancel, false).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert!(migrator.migrated().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_persisted_and_resume_skips_completed_tables() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let failing = Arc::new(RecordingMigrator::failing(&["orders"]));
        let first = orchestrator(shop_catalog(), FakeCatalog::default(), &failing)
            .with_state_file(state_path.clone());
        let err = first.run(CancellationToken::new(), false).await.unwrap_err();
        assert!(matches!(err, MigrateError::WaveFailed { wave: 2, .. }));

        let saved = MigrationState::load(&state_path).unwrap();
        assert_eq!(saved.status, RunStatus::Failed);
        assert_eq!(saved.waves_planned, 3);
        assert_eq!(saved.tables["users"].status, TaskStatus::Completed);
        assert_eq!(saved.tables["orders"].status, TaskStatus::Failed);
        assert!(saved.tables["orders"].error.as_deref().unwrap().contains("dump failed"));
        assert_eq!(saved.tables["line_items"].status, TaskStatus::Pending);

        let healthy = Arc::new(RecordingMigrator::default());
        let second = orchestrator(shop_catalog(), FakeCatalog::default(), &healthy)
            .with_state_file(state_path.clone())
            .resume()
            .unwrap();
        let result = second.run(CancellationToken::new(), false).await.unwrap();

        assert_eq!(result.run_id, saved.run_id);
        assert_eq!(result.tables_skipped, 2);
        assert_eq!(result.tables_migrated, 2);
        assert_eq!(healthy.migrated(), vec!["orders", "line_items"]);
        assert_eq!(MigrationState::load(&state_path).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_config() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let mut state = MigrationState::new("old-run".into(), "some-other-hash".into());
        state.save(&state_path).unwrap();

        let migrator = Arc::new(RecordingMigrator::default());
        let result = orchestrator(shop_catalog(), FakeCatalog::default(), &migrator)
            .with_state_file(state_path)
            .resume();

        assert!(matches!(result, Err(MigrateError::ConfigChanged)));
    }

    #[tokio::test]
    async fn test_validate_reports_missing_tables() {
        let mut target = FakeCatalog::default();
        target.existing = ["users", "orders"].iter().map(|t| t.to_string()).collect();
        let migrator = Arc::new(RecordingMigrator::default());
        let orch = orchestrator(shop_catalog(), target, &migrator);

        let report = orch.validate().await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.present, vec!["users", "orders"]);
        assert_eq!(report.missing, vec!["line_items", "products"]);
    }

    #[test]
    fn test_run_progress_failed_latch() {
        let mut progress = RunProgress::new();
        assert!(!progress.is_failed());
        progress.enter_wave(2);
        progress.mark_failed();
        progress.enter_wave(3);
        assert!(progress.is_failed());
        assert_eq!(progress.current_wave(), 3);
    }
}
