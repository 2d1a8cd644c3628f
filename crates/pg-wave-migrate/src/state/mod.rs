//! File-based state management for resume capability.

use crate::error::{MigrateError, Result};
use crate::graph::Wave;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Migration state for resume capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// Current run status.
    pub status: RunStatus,

    /// Number of waves in the plan.
    #[serde(default)]
    pub waves_planned: usize,

    /// Per-table state.
    pub tables: BTreeMap<String, TableState>,

    /// When the migration finished (successfully or not).
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 signature over the serialized state (excluding this field),
    /// keyed by `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Per-table state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableState {
    /// Task status.
    pub status: TaskStatus,

    /// Wave the table was planned into.
    pub wave: usize,

    /// Number of times a job was started for this table.
    #[serde(default)]
    pub attempts: u32,

    /// When the table was last migrated successfully.
    pub completed_at: Option<DateTime<Utc>>,

    /// Error message if failed.
    pub error: Option<String>,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MigrationState {
    /// Create a new migration state.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            status: RunStatus::Running,
            waves_planned: 0,
            tables: BTreeMap::new(),
            completed_at: None,
            hmac: None,
        }
    }

    /// Compute HMAC-SHA256 signature for state integrity validation.
    ///
    /// The config hash is the key, so a state file only verifies against
    /// the configuration that produced it.
    fn compute_hmac(&self) -> Result<String> {
        let mut state_for_signing = self.clone();
        state_for_signing.hmac = None;

        let content = serde_json::to_string(&state_for_signing)?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        let result = mac.finalize();
        Ok(hex::encode(result.into_bytes()))
    }

    /// Load state from a file with integrity validation.
    ///
    /// A file without a signature is accepted with a warning; a file whose
    /// signature does not match is rejected.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::State(format!("cannot read {}: {}", path.display(), e))
        })?;
        let state: Self = serde_json::from_str(&content)?;

        if let Some(stored_hmac) = &state.hmac {
            let expected_hmac = state.compute_hmac()?;
            if stored_hmac != &expected_hmac {
                return Err(MigrateError::State(
                    "integrity check failed: HMAC mismatch (possible tampering)".to_string(),
                ));
            }
        } else {
            tracing::warn!("State file has no HMAC signature, integrity cannot be verified");
        }

        Ok(state)
    }

    /// Save state to a file (atomic write with HMAC).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();

        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Record the wave plan. Tables already known keep their status; their
    /// wave number is updated to the new plan.
    pub fn record_plan(&mut self, waves: &[Wave]) {
        self.waves_planned = waves.len();
        for wave in waves {
            for table in &wave.tables {
                self.tables
                    .entry(table.clone())
                    .and_modify(|t| t.wave = wave.number)
                    .or_insert_with(|| TableState::new(wave.number));
            }
        }
    }

    /// Get or create table state.
    pub fn get_or_create_table(&mut self, table_name: &str, wave: usize) -> &mut TableState {
        self.tables
            .entry(table_name.to_string())
            .or_insert_with(|| TableState::new(wave))
    }

    /// Check if a table is completed.
    pub fn is_table_completed(&self, table_name: &str) -> bool {
        self.tables
            .get(table_name)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    /// Names of completed tables.
    pub fn completed_tables(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Completed)
            .map(|(name, _)| name.as_str())
    }

    /// Put a finished run back into the running state for resume.
    pub fn reopen(&mut self) {
        self.status = RunStatus::Running;
        self.completed_at = None;
    }

    /// Mark the migration as completed.
    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the migration as failed.
    pub fn mark_failed(&mut self) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the migration as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}

impl TableState {
    /// Create a new table state.
    pub fn new(wave: usize) -> Self {
        Self {
            status: TaskStatus::Pending,
            wave,
            attempts: 0,
            completed_at: None,
            error: None,
        }
    }

    /// Mark the table as in progress.
    pub fn mark_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
        self.attempts += 1;
        self.error = None;
    }

    /// Mark the table as completed.
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    /// Mark the table as failed.
    pub fn mark_failed(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_state_save_load() {
        let mut state = MigrationState::new("test-run".into(), "abc123".into());
        state.get_or_create_table("users", 1);

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let loaded = MigrationState::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "test-run");
        assert_eq!(loaded.config_hash, "abc123");
        assert!(loaded.tables.contains_key("users"));
        assert!(loaded.hmac.is_some());
    }

    #[test]
    fn test_config_validation() {
        let state = MigrationState::new("test-run".into(), "abc123".into());
        assert!(state.validate_config("abc123").is_ok());
        assert!(matches!(
            state.validate_config("different"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_state_json_format_pretty() {
        let mut state = MigrationState::new("test-run".into(), "hash".into());
        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&content).is_ok());
        assert!(content.contains('\n'), "JSON should be pretty-printed");
        assert!(content.contains("\"run_id\""));
        assert!(content.contains("\"status\": \"running\""));
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let mut state = MigrationState::new("test-run".into(), "hash".into());
        state.get_or_create_table("orders", 2).mark_failed("boom");

        let file = NamedTempFile::new().unwrap();
        state.save(file.path()).unwrap();

        let content = std::fs::read_to_string(file.path()).unwrap();
        let tampered = content.replace("\"failed\"", "\"completed\"");
        assert_ne!(content, tampered);
        std::fs::write(file.path(), tampered).unwrap();

        let err = MigrationState::load(file.path()).unwrap_err();
        assert!(matches!(err, MigrateError::State(_)));
    }

    #[test]
    fn test_unsigned_state_is_accepted() {
        let state = MigrationState::new("test-run".into(), "hash".into());
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&state).unwrap()).unwrap();

        let loaded = MigrationState::load(file.path()).unwrap();
        assert_eq!(loaded.run_id, "test-run");
    }

    #[test]
    fn test_missing_state_file_is_state_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MigrationState::load(dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_record_plan_keeps_progress() {
        let mut state = MigrationState::new("test-run".into(), "hash".into());
        state.record_plan(&[Wave::new(1, ["users"]), Wave::new(2, ["orders"])]);
        state.get_or_create_table("users", 1).mark_completed();

        state.record_plan(&[
            Wave::new(1, ["users", "products"]),
            Wave::new(2, ["orders"]),
        ]);

        assert_eq!(state.waves_planned, 2);
        assert!(state.is_table_completed("users"));
        assert_eq!(state.tables["products"].status, TaskStatus::Pending);
        assert_eq!(state.completed_tables().collect::<Vec<_>>(), vec!["users"]);
    }

    #[test]
    fn test_table_lifecycle() {
        let mut table = TableState::new(3);
        table.mark_in_progress();
        table.mark_failed("psql exited with exit status: 3");
        assert_eq!(table.status, TaskStatus::Failed);
        assert_eq!(table.attempts, 1);

        table.mark_in_progress();
        assert!(table.error.is_none());
        table.mark_completed();
        assert_eq!(table.status, TaskStatus::Completed);
        assert_eq!(table.attempts, 2);
        assert!(table.completed_at.is_some());
    }

    #[test]
    fn test_run_status_transitions() {
        let mut state = MigrationState::new("r".into(), "h".into());
        state.mark_failed();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.completed_at.is_some());

        state.reopen();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.completed_at.is_none());

        state.mark_cancelled();
        assert_eq!(state.status, RunStatus::Cancelled);
    }
}
