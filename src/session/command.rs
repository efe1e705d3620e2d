//! Subprocess-backed agent session driver.
//!
//! Thin I/O wrapper around an external agent CLI: one invocation per
//! hand-off, the task context passed through the environment and the prompt
//! on stdin, success read from the exit status. The scheduler neither knows
//! nor cares what the command actually runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{AgentSessionDriver, SessionContext};

/// Runs `program [args...]` in the workspace root for every hand-off.
pub struct CommandSessionDriver {
    program: String,
    args: Vec<String>,
}

impl CommandSessionDriver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn prompt_for(ctx: &SessionContext) -> String {
        let mut prompt = String::new();
        prompt.push_str(&ctx.directive);
        prompt.push_str("\n\n# Task: ");
        prompt.push_str(&ctx.task.title);
        prompt.push('\n');
        if !ctx.task.description.is_empty() {
            prompt.push_str(&ctx.task.description);
            prompt.push('\n');
        }
        if let Some(plan) = &ctx.task.plan {
            prompt.push_str("\n## Plan\n");
            prompt.push_str(plan);
            prompt.push('\n');
        }
        if !ctx.task.acceptance_criteria.is_empty() {
            prompt.push_str("\n## Acceptance criteria\n");
            for criterion in &ctx.task.acceptance_criteria {
                let mark = if criterion.done { "x" } else { " " };
                prompt.push_str(&format!("- [{mark}] {}\n", criterion.text));
            }
        }
        prompt
    }
}

#[async_trait]
impl AgentSessionDriver for CommandSessionDriver {
    async fn execute(&self, ctx: SessionContext) -> Result<bool> {
        info!(
            task_id = %ctx.task.id,
            session_id = %ctx.session_id,
            program = %self.program,
            "starting agent session"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&ctx.workspace.root)
            .env("STEWARD_TASK_ID", &ctx.task.id)
            .env("STEWARD_SESSION_ID", &ctx.session_id)
            .env("STEWARD_WORKSPACE", &ctx.workspace.root)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn `{}` — is it installed and on PATH?",
                    self.program
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = Self::prompt_for(&ctx);
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            // Close stdin so the agent sees EOF.
            drop(stdin);
        }

        let status = child.wait().await.context("agent session wait failed")?;
        debug!(
            task_id = %ctx.task.id,
            code = ?status.code(),
            "agent session exited"
        );
        Ok(status.success())
    }
}
