//! Moving one table from source to target.
//!
//! A table job stages a private directory, dumps the table from the source
//! into a plain SQL artifact, checks the artifact is non-empty, then replays
//! it against the target. [`BulkTransfer`] is the seam for the external
//! dump/restore programs; [`PgTools`] drives `pg_dump` and `psql`.

mod process;

pub use process::{DumpOptions, PgTools};

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Step of a table job at which it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Creating the job's working directory.
    Staging,
    /// Dumping from the source.
    Dump,
    /// Checking the dump artifact.
    Verify,
    /// Replaying into the target.
    Restore,
    /// The job task itself died or never ran to completion.
    Execution,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Staging => "staging",
            Stage::Dump => "dump",
            Stage::Verify => "verify",
            Stage::Restore => "restore",
            Stage::Execution => "execution",
        };
        f.write_str(name)
    }
}

/// Failure of an external dump or restore program.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("{program} was terminated")]
    Cancelled { program: String },
}

/// Failure of a single table job.
#[derive(Debug, Error)]
#[error("{stage} failed for table {table}: {cause}")]
pub struct JobError {
    pub table: String,
    pub stage: Stage,
    #[source]
    pub cause: JobCause,
}

impl JobError {
    pub fn new(table: impl Into<String>, stage: Stage, cause: impl Into<JobCause>) -> Self {
        Self {
            table: table.into(),
            stage,
            cause: cause.into(),
        }
    }

    /// Job ended without a result (panicked, aborted, or cut off by a timeout).
    pub fn aborted(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(table, Stage::Execution, JobCause::Aborted(reason.into()))
    }
}

/// Underlying reason for a [`JobError`].
#[derive(Debug, Error)]
pub enum JobCause {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("dump artifact {} was not created", .0.display())]
    MissingArtifact(PathBuf),

    #[error("dump artifact {} is empty", .0.display())]
    EmptyArtifact(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Aborted(String),
}

/// External programs that move a table's schema and rows.
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    /// Dump the tables matching `pattern` from the source into `artifact`.
    async fn dump(
        &self,
        pattern: &str,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    /// Replay `artifact` against the target.
    async fn restore(&self, artifact: &Path, cancel: &CancellationToken) -> Result<(), ToolError>;
}

/// Migrates one table end to end.
#[async_trait]
pub trait TableMigrator: Send + Sync {
    async fn migrate_table(&self, table: &str, cancel: &CancellationToken) -> Result<(), JobError>;
}

/// [`TableMigrator`] that stages a dump artifact on local disk.
pub struct DumpRestoreMigrator<T> {
    transfer: T,
    schema: String,
    staging: TempDir,
}

impl<T: BulkTransfer> DumpRestoreMigrator<T> {
    /// Create a migrator with a fresh staging directory under the system temp dir.
    pub fn new(transfer: T, schema: impl Into<String>) -> std::io::Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix("pg-wave-migrate-")
            .tempdir()?;
        debug!("Staging dump artifacts in {}", staging.path().display());
        Ok(Self {
            transfer,
            schema: schema.into(),
            staging,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Exact-match `pg_dump --table` pattern for `table`.
    pub fn table_pattern(&self, table: &str) -> String {
        format!("{}.{}", quote_pattern(&self.schema), quote_pattern(table))
    }
}

#[async_trait]
impl<T: BulkTransfer> TableMigrator for DumpRestoreMigrator<T> {
    async fn migrate_table(&self, table: &str, cancel: &CancellationToken) -> Result<(), JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::aborted(table, "cancelled before start"));
        }

        // Dropped on return, removing the artifact with it.
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}-", artifact_stem(table)))
            .tempdir_in(self.staging.path())
            .map_err(|e| JobError::new(table, Stage::Staging, e))?;
        let artifact = workdir.path().join(format!("{}_dump.sql", artifact_stem(table)));

        debug!("{}: dumping to {}", table, artifact.display());
        self.transfer
            .dump(&self.table_pattern(table), &artifact, cancel)
            .await
            .map_err(|e| JobError::new(table, Stage::Dump, e))?;

        match tokio::fs::metadata(&artifact).await {
            Ok(meta) if meta.len() == 0 => {
                return Err(JobError::new(
                    table,
                    Stage::Verify,
                    JobCause::EmptyArtifact(artifact),
                ));
            }
            Ok(meta) => debug!("{}: dump artifact is {} bytes", table, meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::new(
                    table,
                    Stage::Verify,
                    JobCause::MissingArtifact(artifact),
                ));
            }
            Err(e) => return Err(JobError::new(table, Stage::Verify, e)),
        }

        self.transfer
            .restore(&artifact, cancel)
            .await
            .map_err(|e| JobError::new(table, Stage::Restore, e))?;

        debug!("{}: restored", table);
        Ok(())
    }
}

/// Double-quote an identifier for a pg_dump pattern so it matches literally.
fn quote_pattern(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// File-name-safe form of a table name.
fn artifact_stem(table: &str) -> String {
    table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
