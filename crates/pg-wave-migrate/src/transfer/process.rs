//! `pg_dump` / `psql` invocation.

use super::{BulkTransfer, ToolError};
use crate::config::{EndpointConfig, ToolCommand, ToolsConfig};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Object-handling flags passed to the dump program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpOptions {
    /// Emit DROP statements before CREATE.
    pub clean: bool,
    /// Make those DROPs `IF EXISTS`.
    pub if_exists: bool,
    /// Skip ownership commands.
    pub no_owner: bool,
    /// Skip GRANT/REVOKE.
    pub no_privileges: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            clean: true,
            if_exists: true,
            no_owner: true,
            no_privileges: true,
        }
    }
}

/// [`BulkTransfer`] backed by the PostgreSQL client programs.
///
/// The dump is a plain-format script, so restoring it into a target that
/// already holds the table drops and recreates it.
#[derive(Debug, Clone)]
pub struct PgTools {
    dump: ToolCommand,
    restore: ToolCommand,
    source_url: String,
    target_url: String,
    options: DumpOptions,
}

impl PgTools {
    pub fn new(tools: &ToolsConfig, source: &EndpointConfig, target: &EndpointConfig) -> Self {
        Self {
            dump: tools.dump.clone(),
            restore: tools.restore.clone(),
            source_url: source.url.clone(),
            target_url: target.url.clone(),
            options: DumpOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DumpOptions) -> Self {
        self.options = options;
        self
    }

    fn dump_args(&self, pattern: &str, artifact: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            format!("--dbname={}", self.source_url).into(),
            "--table".into(),
            pattern.into(),
        ];
        if self.options.clean {
            args.push("--clean".into());
        }
        if self.options.if_exists {
            args.push("--if-exists".into());
        }
        if self.options.no_owner {
            args.push("--no-owner".into());
        }
        if self.options.no_privileges {
            args.push("--no-privileges".into());
        }
        args.push("--file".into());
        args.push(artifact.into());
        args
    }

    fn restore_args(&self, artifact: &Path) -> Vec<OsString> {
        vec![
            format!("--dbname={}", self.target_url).into(),
            "--no-psqlrc".into(),
            "--quiet".into(),
            "--set=ON_ERROR_STOP=1".into(),
            "--file".into(),
            artifact.into(),
        ]
    }
}

#[async_trait]
impl BulkTransfer for PgTools {
    async fn dump(
        &self,
        pattern: &str,
        artifact: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        run_tool(&self.dump, self.dump_args(pattern, artifact), cancel).await?;
        Ok(())
    }

    async fn restore(&self, artifact: &Path, cancel: &CancellationToken) -> Result<(), ToolError> {
        run_tool(&self.restore, self.restore_args(artifact), cancel).await?;
        Ok(())
    }
}

/// Run `tool` to completion, killing it if `cancel` fires first.
///
/// Output is captured; a non-zero exit becomes [`ToolError::Exit`] carrying
/// both streams.
async fn run_tool(
    tool: &ToolCommand,
    args: Vec<OsString>,
    cancel: &CancellationToken,
) -> Result<Output, ToolError> {
    let program = tool.program.clone();
    let mut command = Command::new(&tool.program);
    command
        .args(&tool.prefix_args)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own group, so wrappers such as `sh -c` can be killed with their children.
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!("Started {} (pid {:?})", program, pid);

    // Losing the race drops the child, and kill_on_drop terminates it.
    let output = tokio::select! {
        result = child.wait_with_output() => result.map_err(|source| ToolError::Wait {
            program: program.clone(),
            source,
        })?,
        _ = cancel.cancelled() => {
            debug!("Terminating {}", program);
            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }
            return Err(ToolError::Cancelled { program });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        return Err(ToolError::Exit {
            program,
            status: output.status.to_string(),
            stdout,
            stderr,
        });
    }

    if !stderr.is_empty() {
        trace!("{} stderr: {}", program, stderr);
    }
    Ok(output)
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let group = format!("-{}", pid);
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("kill of process group {} exited with {}", pid, status),
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}
