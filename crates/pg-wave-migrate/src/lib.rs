//! # pg-wave-migrate
//!
//! Foreign-key aware PostgreSQL to PostgreSQL table migration.
//!
//! Tables are discovered from the source catalog, ordered by their foreign
//! keys into waves, and each wave is copied with `pg_dump`/`psql` under a
//! bounded number of concurrent jobs:
//!
//! - **Wave planning** so referenced tables load before their dependents
//! - **Bounded concurrency** with a staggered launch within each wave
//! - **Per-wave timeout**; the first failed wave stops the run
//! - **Resume capability** via signed JSON state files
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_wave_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pg_wave_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     config.validate()?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(CancellationToken::new(), false).await?;
//!     println!("Migrated {} tables in {} waves", result.tables_migrated, result.waves_total);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod source;
pub mod state;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, EndpointConfig, MigrationConfig, ToolCommand, ToolsConfig};
pub use error::{MigrateError, Result};
pub use graph::{plan_waves, DependencyGraph, Table, Wave};
pub use orchestrator::{
    discover_graph, health_check, HealthCheckResult, MigrationResult, Orchestrator,
    ValidationReport,
};
pub use source::{MetadataSource, PgCatalog};
pub use state::MigrationState;
pub use transfer::{DumpRestoreMigrator, JobError, PgTools, TableMigrator};
