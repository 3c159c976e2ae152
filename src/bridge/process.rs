//! Spawning agent subprocesses.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use super::BridgeConfig;
use crate::error::BridgeError;

/// The pipes of a freshly spawned agent.
pub struct ProcessHandle {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// The OS process, when there is one. In-memory fakes leave this empty.
    pub child: Option<Child>,
}

/// Factory for agent processes. Injected into a [`Bridge`](super::Bridge) so
/// tests can substitute an in-memory agent.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, config: &BridgeConfig) -> Result<ProcessHandle, BridgeError>;
}

/// Spawns the configured agent command as a real child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self, config: &BridgeConfig) -> Result<ProcessHandle, BridgeError> {
        let mut child = Command::new(&config.command.program)
            .args(&config.command.args)
            .envs(&config.command.env)
            .current_dir(&config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                name: config.name.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BridgeError::Spawn {
                name: config.name.clone(),
                source: std::io::Error::other("agent stdio was not captured"),
            });
        };

        // Read stderr in a separate task (for debugging)
        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!(agent = %name, "stderr: {}", line);
                    }
                }
            });
        }

        tracing::debug!(
            agent = %config.name,
            pid = child.id().unwrap_or_default(),
            program = %config.command.program,
            "Spawned agent process"
        );

        Ok(ProcessHandle {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentCommand;

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let config = BridgeConfig {
            name: "main".into(),
            command: AgentCommand {
                program: "definitely-not-an-agent-binary".into(),
                args: vec![],
                env: Default::default(),
            },
            ..Default::default()
        };
        let err = CommandSpawner.spawn(&config).await.err().unwrap();
        assert!(matches!(err, BridgeError::Spawn { ref name, .. } if name == "main"));
    }
}
