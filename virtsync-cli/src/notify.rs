//! Change report delivery through a local mail command

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use virtsync_core::config::NotifySettings;
use virtsync_core::report::SyncOutcome;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("cannot parse mail command {command:?}: {source}")]
    Parse {
        command: String,
        #[source]
        source: shell_words::ParseError,
    },
    #[error("mail command is empty")]
    EmptyCommand,
    #[error("cannot run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: std::process::ExitStatus },
}

pub struct Notifier {
    settings: NotifySettings,
}

impl Notifier {
    pub fn new(settings: NotifySettings) -> Self {
        Self { settings }
    }

    /// Mail goes out only when configured and something changed.
    pub fn should_send(&self, outcome: &SyncOutcome) -> bool {
        self.settings.is_enabled() && outcome.has_changes()
    }

    /// RFC 822 message: headers, blank line, text report.
    pub fn render(&self, outcome: &SyncOutcome) -> String {
        let from = self.settings.from.as_deref().unwrap_or_default();
        format!(
            "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {date}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}",
            to = self.settings.to.join(", "),
            subject = self.settings.subject,
            date = outcome.finished_at.to_rfc2822(),
            body = outcome.render_text(),
        )
    }

    /// Pipes the rendered message to the mail command's stdin.
    pub async fn send(&self, outcome: &SyncOutcome) -> Result<(), NotifyError> {
        let argv = shell_words::split(&self.settings.command).map_err(|source| NotifyError::Parse {
            command: self.settings.command.clone(),
            source,
        })?;
        let (program, args) = argv.split_first().ok_or(NotifyError::EmptyCommand)?;

        let spawn_error = |source| NotifyError::Spawn {
            program: program.clone(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(spawn_error)?;

        let message = self.render(outcome);
        let written = match child.stdin.take() {
            // Dropping stdin closes it, which ends the message.
            Some(mut stdin) => stdin.write_all(message.as_bytes()).await,
            None => Ok(()),
        };

        // An early exit shows up as a broken pipe; the exit status says more.
        let status = child.wait().await.map_err(spawn_error)?;
        if !status.success() {
            return Err(NotifyError::Failed {
                program: program.clone(),
                status,
            });
        }
        written.map_err(spawn_error)?;

        debug!(bytes = message.len(), %program, "mail command completed");
        info!(recipients = self.settings.to.len(), "change report sent");
        Ok(())
    }
}
