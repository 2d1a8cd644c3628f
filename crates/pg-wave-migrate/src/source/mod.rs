//! Database metadata discovery.
//!
//! [`MetadataSource`] is the narrow view of an endpoint the scheduler needs:
//! which tables exist and which tables each one references. [`PgCatalog`]
//! answers it from PostgreSQL's catalogs.

mod postgres;
pub mod tls;

pub use postgres::PgCatalog;

use async_trait::async_trait;

use crate::error::Result;

/// Table and foreign-key discovery for one endpoint.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Base tables in scope for migration, with excluded names (backups,
    /// snapshots) already filtered out.
    async fn list_eligible_tables(&self) -> Result<Vec<String>>;

    /// Names of the tables `table` references through foreign keys.
    async fn foreign_keys_of(&self, table: &str) -> Result<Vec<String>>;

    /// Whether `table` exists on this endpoint. Diagnostic use only.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Human-readable endpoint description for logs (no credentials).
    fn describe(&self) -> String;
}
