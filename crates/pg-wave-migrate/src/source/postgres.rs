//! PostgreSQL catalog queries.

use crate::config::EndpointConfig;
use crate::error::{MigrateError, Result};
use crate::source::tls::{self, SslMode};
use crate::source::MetadataSource;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info};

/// Connect timeout applied when the connection string sets none.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Catalog access for one PostgreSQL endpoint.
pub struct PgCatalog {
    pool: Pool,
    schema: String,
    exclude_patterns: Vec<String>,
    label: String,
}

impl PgCatalog {
    /// Connect to an endpoint and verify it answers.
    ///
    /// `role` ("source" or "target") names the endpoint in errors and logs.
    /// Any failure here is a [`MigrateError::Connectivity`].
    pub async fn connect(
        role: &str,
        endpoint: &EndpointConfig,
        schema: &str,
        exclude_patterns: &[String],
        max_conns: usize,
    ) -> Result<Self> {
        let mut pg_config: PgConfig = endpoint
            .url
            .parse()
            .map_err(|e| MigrateError::Config(format!("{} url is invalid: {}", role, e)))?;
        if pg_config.get_connect_timeout().is_none() {
            pg_config.connect_timeout(CONNECT_TIMEOUT);
        }

        let ssl_mode = match &endpoint.ssl_mode {
            Some(mode) => SslMode::parse(mode)?,
            None => SslMode::from_pg(pg_config.get_ssl_mode()),
        };
        pg_config.ssl_mode(ssl_mode.to_pg());

        let label = describe_config(&pg_config);
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match tls::connector(ssl_mode)? {
            None => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| MigrateError::pool(e, format!("creating {} pool", role)))?
            }
            Some(tls_connector) => {
                let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns)
                    .build()
                    .map_err(|e| MigrateError::pool(e, format!("creating {} pool", role)))?
            }
        };

        let catalog = Self {
            pool,
            schema: schema.to_string(),
            exclude_patterns: exclude_patterns.to_vec(),
            label,
        };

        catalog
            .ping()
            .await
            .map_err(|e| MigrateError::connectivity(role, format!("{} ({})", e, catalog.label)))?;

        info!("Connected to {} database: {}", role, catalog.label);
        Ok(catalog)
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting connection for {}", context)))
    }

    async fn ping(&self) -> std::result::Result<(), String> {
        let client = self.pool.get().await.map_err(|e| e.to_string())?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl MetadataSource for PgCatalog {
    async fn list_eligible_tables(&self) -> Result<Vec<String>> {
        let client = self.client("list_eligible_tables").await?;

        let query = r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = $1
              AND table_type = 'BASE TABLE'
              AND NOT (table_name::text LIKE ANY($2::text[]))
            ORDER BY table_name
        "#;

        let rows = client
            .query(query, &[&self.schema, &self.exclude_patterns])
            .await
            .map_err(|e| MigrateError::Metadata(format!("listing tables in {}: {}", self.schema, e)))?;

        let tables: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        debug!("Found {} eligible tables in {}", tables.len(), self.schema);
        Ok(tables)
    }

    async fn foreign_keys_of(&self, table: &str) -> Result<Vec<String>> {
        let client = self.client("foreign_keys_of").await?;

        let query = r#"
            SELECT DISTINCT rt.relname::text AS ref_table
            FROM pg_catalog.pg_constraint c
            JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
            JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
            WHERE c.contype = 'f'
              AND n.nspname = $1
              AND t.relname = $2
              AND rn.nspname = $1
            ORDER BY 1
        "#;

        let rows = client
            .query(query, &[&self.schema, &table])
            .await
            .map_err(|e| MigrateError::Metadata(format!("loading foreign keys of {}: {}", table, e)))?;

        let refs: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        debug!("{} references {:?}", table, refs);
        Ok(refs)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let client = self.client("table_exists").await?;

        let query = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
        "#;

        let row = client.query_one(query, &[&self.schema, &table]).await?;
        Ok(row.get(0))
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.client("test_connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// `host:port/dbname` for logs.
fn describe_config(config: &PgConfig) -> String {
    let host = config
        .get_hosts()
        .first()
        .map(|h| match h {
            tokio_postgres::config::Host::Tcp(name) => name.clone(),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(path) => path.display().to_string(),
        })
        .unwrap_or_else(|| "localhost".to_string());
    let port = config.get_ports().first().copied().unwrap_or(5432);
    let dbname = config.get_dbname().unwrap_or("postgres");
    format!("{}:{}/{}", host, port, dbname)
}
