//! Thin tmux driver.
//!
//! Two distinct input paths, and the distinction matters: command argv
//! goes through `send-keys` with per-argument shell escaping, while
//! prompt text goes through a buffer and bracketed paste so the
//! provider CLI's line editor treats it as one user message regardless
//! of embedded newlines.

use std::path::Path;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::subprocess::{ProcessCommandBuilder, SubprocessManager};

const TMUX_TIMEOUT: Duration = Duration::from_secs(10);
const PASTE_SETTLE_DELAY: Duration = Duration::from_millis(250);
const PROMPT_BUFFER: &str = "devchain-prompt";

#[derive(Clone)]
pub struct TmuxDriver {
    subprocess: SubprocessManager,
}

impl TmuxDriver {
    pub fn new(subprocess: SubprocessManager) -> Self {
        Self { subprocess }
    }

    async fn tmux(&self, args: &[&str], stdin: Option<String>) -> Result<String> {
        let mut builder = ProcessCommandBuilder::new("tmux")
            .args(args)
            .timeout(TMUX_TIMEOUT);
        if let Some(stdin) = stdin {
            builder = builder.stdin(stdin);
        }
        let output = self.subprocess.runner().run(builder.build()).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(OrchestratorError::external(format!(
                "tmux {} failed: {}",
                args.join(" "),
                output.combined_message()
            )))
        }
    }

    pub async fn has_session(&self, name: &str) -> Result<bool> {
        let command = ProcessCommandBuilder::new("tmux")
            .args(["has-session", "-t", name])
            .timeout(TMUX_TIMEOUT)
            .build();
        let output = self.subprocess.runner().run(command).await?;
        Ok(output.status.success())
    }

    /// Create a detached session in `cwd` with the alternate screen
    /// disabled so provider output stays in scrollback.
    pub async fn create_session(&self, name: &str, cwd: &Path) -> Result<()> {
        let cwd = cwd.to_string_lossy();
        self.tmux(&["new-session", "-d", "-s", name, "-c", &cwd], None)
            .await?;
        self.tmux(
            &["set-option", "-t", name, "alternate-screen", "off"],
            None,
        )
        .await?;
        Ok(())
    }

    /// Type a command line into the session. Each argument is shell
    /// escaped individually before joining.
    pub async fn send_command_line(&self, name: &str, argv: &[String]) -> Result<()> {
        let line = shell_words::join(argv.iter().map(String::as_str));
        self.tmux(&["send-keys", "-t", name, &line, "Enter"], None)
            .await?;
        Ok(())
    }

    /// Paste text as a single bracketed-paste unit, wait for the line
    /// editor to settle, then submit with Enter.
    pub async fn paste_and_submit(&self, name: &str, text: &str) -> Result<()> {
        self.tmux(
            &["load-buffer", "-b", PROMPT_BUFFER, "-"],
            Some(text.to_string()),
        )
        .await?;
        self.tmux(
            &["paste-buffer", "-p", "-d", "-b", PROMPT_BUFFER, "-t", name],
            None,
        )
        .await?;
        tokio::time::sleep(PASTE_SETTLE_DELAY).await;
        self.tmux(&["send-keys", "-t", name, "Enter"], None).await?;
        Ok(())
    }

    pub async fn kill_session(&self, name: &str) -> Result<()> {
        self.tmux(&["kill-session", "-t", name], None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn has_session_maps_exit_codes() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| args == ["has-session", "-t", "present"])
            .finish();
        mock.expect_command("tmux")
            .with_args(|args| args == ["has-session", "-t", "absent"])
            .returns_exit_code(1)
            .finish();

        let tmux = TmuxDriver::new(subprocess);
        assert!(tmux.has_session("present").await.unwrap());
        assert!(!tmux.has_session("absent").await.unwrap());
    }

    #[tokio::test]
    async fn command_line_is_escaped_per_argument() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| {
                args.first().map(String::as_str) == Some("send-keys")
                    && args.contains(&"/usr/bin/claude --permission-mode 'bypass perms'".to_string())
            })
            .finish();

        let tmux = TmuxDriver::new(subprocess);
        tmux.send_command_line(
            "s1",
            &[
                "/usr/bin/claude".to_string(),
                "--permission-mode".to_string(),
                "bypass perms".to_string(),
            ],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn paste_uses_bracketed_paste_then_enter() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("tmux")
            .with_args(|args| args.first().map(String::as_str) == Some("load-buffer"))
            .finish();
        mock.expect_command("tmux")
            .with_args(|args| args.first().map(String::as_str) == Some("paste-buffer") && args.contains(&"-p".to_string()))
            .finish();
        mock.expect_command("tmux")
            .with_args(|args| args.first().map(String::as_str) == Some("send-keys") && args.last().map(String::as_str) == Some("Enter"))
            .finish();

        let tmux = TmuxDriver::new(subprocess);
        tmux.paste_and_submit("s1", "line one\nline two").await.unwrap();

        let history = mock.call_history();
        let load = history
            .iter()
            .find(|c| c.args.first().map(String::as_str) == Some("load-buffer"))
            .unwrap();
        assert_eq!(load.stdin.as_deref(), Some("line one\nline two"));
    }
}
