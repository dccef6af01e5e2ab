//! Post-update hook

use tokio::process::Command;
use tracing::{debug, info};

use super::ClientError;

/// Command run after certificate files changed
#[derive(Debug, Clone)]
pub struct Hook {
    program: String,
    args: Vec<String>,
}

impl Hook {
    /// Build from an argv list, `None` when the list is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub async fn run(&self) -> Result<(), ClientError> {
        debug!(program = %self.program, args = ?self.args, "Running post-update hook");

        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ClientError::Hook(format!("failed to start '{}': {}", self.program, e)))?;

        if !output.status.success() {
            return Err(ClientError::Hook(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(program = %self.program, "Post-update hook finished");
        Ok(())
    }
}
