//! Script load protocol: source file to named script on the controller.

use super::FirmwareManager;
use crate::chunk::ChunkLineReader;
use crate::error::{ensure_not_blank, TspError, TspResult};
use crate::script::{trimmed_path, ScriptEntity};
use crate::session::syntax;
use std::path::Path;
use tracing::{debug, info, warn};

/// Interactive settings captured before a load.
#[derive(Debug, Clone, Copy)]
struct InteractiveSnapshot {
    show_errors: bool,
    show_prompts: bool,
}

/// Result of streaming a script body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Lines transmitted, as sent without the trailing space.
    pub trimmed: Vec<String>,
    /// The completion sentinel arrived, or its absence was ignored.
    pub completed: bool,
}

/// Per-load settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Echo errors while streaming.
    pub show_errors: bool,
    /// Track execution state through prompts while streaming.
    pub show_prompts: bool,
    /// Keep leading indentation; `None` uses the configured default.
    pub retain_outline: Option<bool>,
}

impl LoadOptions {
    /// Options using the configured outline handling.
    #[must_use]
    pub fn new(show_errors: bool, show_prompts: bool) -> Self {
        Self {
            show_errors,
            show_prompts,
            retain_outline: None,
        }
    }

    /// Overrides the configured outline handling for this load.
    #[must_use]
    pub fn with_retain_outline(mut self, retain_outline: bool) -> Self {
        self.retain_outline = Some(retain_outline);
        self
    }
}

impl FirmwareManager {
    /// Loads `script` from its source file.
    ///
    /// `show_errors` and `show_prompts` select the interactive settings used
    /// while streaming; both are restored afterwards on every path. A
    /// `<stem>.trimmed.tsp` copy of the transmitted lines is written next to
    /// the source unless one exists already.
    ///
    /// Returns whether the load completed within the configured timeout.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for blank script fields
    /// - `FileNotFound` when the source does not exist, before any I/O
    /// - `InvalidOperation` when the instrument reports `IdleError`
    /// - `Timeout` when the completion wait expires under `RaiseTimeoutError`
    pub async fn load_script(
        &self,
        script: &mut ScriptEntity,
        show_errors: bool,
        show_prompts: bool,
    ) -> TspResult<bool> {
        self.load_script_with(script, LoadOptions::new(show_errors, show_prompts))
            .await
    }

    /// [`load_script`](Self::load_script) with explicit [`LoadOptions`].
    pub async fn load_script_with(
        &self,
        script: &mut ScriptEntity,
        options: LoadOptions,
    ) -> TspResult<bool> {
        script.script.validate()?;
        let path = script.script.file_path();
        if !path.exists() {
            return Err(TspError::FileNotFound(path));
        }
        let source = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<&str> = source.lines().collect();

        let outcome = self
            .load_lines_with(&script.script.name, &lines, options)
            .await?;
        self.write_trimmed_copy(&path, &outcome.trimmed).await;

        script.loaded = outcome.completed;
        script.reset_save_state();
        Ok(outcome.completed)
    }

    /// Loads a script body from memory under `name`.
    pub async fn load_script_lines(
        &self,
        name: &str,
        lines: &[&str],
        show_errors: bool,
        show_prompts: bool,
    ) -> TspResult<LoadOutcome> {
        self.load_lines_with(name, lines, LoadOptions::new(show_errors, show_prompts))
            .await
    }

    /// [`load_script_lines`](Self::load_script_lines) with explicit [`LoadOptions`].
    pub async fn load_lines_with(
        &self,
        name: &str,
        lines: &[&str],
        options: LoadOptions,
    ) -> TspResult<LoadOutcome> {
        ensure_not_blank("name", name)?;
        let session = self.session();
        let retain_outline = options
            .retain_outline
            .unwrap_or(self.config().retain_outline);

        let snapshot = self.read_interactive().await?;
        let result = match self.apply_interactive(snapshot, options).await {
            Ok(()) => self.stream_script(name, lines, retain_outline).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            session.flush_quietly().await;
        }
        let restored = self.restore_interactive(snapshot, options).await;

        let outcome = result?;
        restored?;
        Ok(outcome)
    }

    async fn read_interactive(&self) -> TspResult<InteractiveSnapshot> {
        let session = self.session();
        let interactive = self.interactive();
        Ok(InteractiveSnapshot {
            show_prompts: interactive.read_show_prompts(session).await?,
            show_errors: interactive.read_show_errors(session).await?,
        })
    }

    async fn apply_interactive(
        &self,
        snapshot: InteractiveSnapshot,
        options: LoadOptions,
    ) -> TspResult<()> {
        let session = self.session();
        let interactive = self.interactive();
        if snapshot.show_errors != options.show_errors {
            interactive
                .write_show_errors(session, options.show_errors)
                .await?;
        }
        if snapshot.show_prompts != options.show_prompts {
            interactive
                .write_show_prompts(session, options.show_prompts)
                .await?;
        }
        session.flush_quietly().await;
        Ok(())
    }

    /// Writes back every setting that differs from the snapshot, even after
    /// an earlier write failed; the first failure is returned.
    async fn restore_interactive(
        &self,
        snapshot: InteractiveSnapshot,
        options: LoadOptions,
    ) -> TspResult<()> {
        let session = self.session();
        let interactive = self.interactive();
        let mut restored = Ok(());
        if snapshot.show_errors != options.show_errors {
            if let Err(e) = interactive
                .write_show_errors(session, snapshot.show_errors)
                .await
            {
                warn!(error = %e, "failed to restore show errors");
                restored = Err(e);
            }
        }
        if snapshot.show_prompts != options.show_prompts {
            if let Err(e) = interactive
                .write_show_prompts(session, snapshot.show_prompts)
                .await
            {
                warn!(error = %e, "failed to restore show prompts");
                restored = restored.and(Err(e));
            }
        }
        // Prompts printed after the load belong to no reply.
        if options.show_prompts || snapshot.show_prompts {
            session.flush_quietly().await;
        }
        restored
    }

    async fn stream_script(
        &self,
        name: &str,
        lines: &[&str],
        retain_outline: bool,
    ) -> TspResult<LoadOutcome> {
        let session = self.session();
        self.announce(&format!("Loading {name}")).await;
        session.set_last_action(format!("opening script '{name}'"));
        session
            .write_line(&syntax::load_script_command(name))
            .await?;
        self.ensure_not_idle_error(name).await?;

        let mut reader = ChunkLineReader::new(retain_outline);
        let mut trimmed = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            let classified = reader.next_line(line);
            if !classified.content_type.is_syntax() || classified.live.is_empty() {
                continue;
            }
            session.set_last_action(format!("loading '{name}' line {}", index + 1));
            session.write_line(&format!("{} ", classified.live)).await?;
            self.ensure_not_idle_error(name).await?;
            trimmed.push(classified.live);
        }

        session.set_last_action(format!("closing script '{name}'"));
        session.write_line(&syntax::end_script_command()).await?;
        let timeout = self.config().load_completion_timeout();
        let completion = session.await_operation_completed_reply(timeout).await?;
        if !completion.completed {
            session.throw_device_exception_if_error().await?;
        }
        let completed = self
            .config()
            .timeout_policy
            .apply(completion.completed, &session.last_action(), timeout)?;
        info!(script = name, lines = trimmed.len(), completed, elapsed = ?completion.elapsed, "loaded script");
        Ok(LoadOutcome { trimmed, completed })
    }

    async fn ensure_not_idle_error(&self, name: &str) -> TspResult<()> {
        self.interactive()
            .ensure_not_idle_error(self.session(), name)
            .await
    }

    /// Writes the debug copy; failures are only logged.
    async fn write_trimmed_copy(&self, source: &Path, lines: &[String]) {
        let path = trimmed_path(source);
        if path.exists() && !self.config().overwrite_trimmed {
            debug!(path = %path.display(), "keeping existing trimmed copy");
            return;
        }
        let mut text = lines.join("\n");
        text.push('\n');
        if let Err(e) = tokio::fs::write(&path, text).await {
            warn!(path = %path.display(), error = %e, "failed to write trimmed copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, SessionConfig};
    use crate::firmware::TimeoutPolicy;
    use crate::session::{MockInstrument, TspSession};
    use crate::subsystem::ExecutionState;

    fn manager(mock: &MockInstrument, config: ProtocolConfig) -> FirmwareManager {
        FirmwareManager::new(TspSession::new(mock.clone(), SessionConfig::immediate()), config)
    }

    #[tokio::test]
    async fn test_load_lines_with_prompts() {
        let mock = MockInstrument::new();
        let manager = manager(&mock, ProtocolConfig::immediate());
        let outcome = manager
            .load_script_lines("foo", &["x = 1", "-- note", "print(x)"], true, true)
            .await
            .unwrap();
        assert!(outcome.completed);
        assert_eq!(outcome.trimmed, vec!["x = 1", "print(x)"]);
        assert_eq!(mock.script(1, "foo").unwrap().body, vec!["x = 1", "print(x)"]);

        // restored to the instrument defaults
        assert!(!manager.session().prompts_enabled());
        assert_eq!(manager.interactive().show_errors(), Some(false));
        assert_eq!(mock.pending_output(), 0);
    }

    #[tokio::test]
    async fn test_idle_error_mid_script_restores_settings() {
        let mock = MockInstrument::new();
        mock.fail_on("broken");
        let manager = manager(&mock, ProtocolConfig::immediate());
        let err = manager
            .load_script_lines("foo", &["x = 1", "broken(", "y = 2"], true, true)
            .await
            .unwrap_err();
        match err {
            TspError::InvalidOperation {
                execution_state,
                last_action,
                detail,
            } => {
                assert_eq!(execution_state, ExecutionState::IdleError);
                assert!(last_action.contains("line 2"));
                assert!(detail.contains("-285"));
            }
            other => panic!("unexpected error {other}"),
        }
        let writes = mock.writes();
        assert!(!writes.iter().any(|w| w.starts_with("y = 2")));
        assert!(!writes.iter().any(|w| w.starts_with("endscript")));
        assert!(writes.ends_with(&[
            syntax::show_errors_command(false),
            syntax::show_prompts_command(false),
        ]));
    }

    #[tokio::test]
    async fn test_completion_timeout_policies() {
        let mock = MockInstrument::new();
        mock.hold_operation_completion(true);

        let raise = manager(&mock, ProtocolConfig::immediate());
        let err = raise
            .load_script_lines("foo", &["x = 1"], false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TspError::Timeout { .. }));

        let lenient = manager(
            &mock,
            ProtocolConfig {
                timeout_policy: TimeoutPolicy::ReturnFailure,
                ..ProtocolConfig::immediate()
            },
        );
        let outcome = lenient
            .load_script_lines("foo", &["x = 1"], false, false)
            .await
            .unwrap();
        assert!(!outcome.completed);
    }

    #[tokio::test]
    async fn test_failed_apply_restores_what_was_changed() {
        let mock = MockInstrument::new();
        mock.fail_transport_on(&syntax::show_prompts_command(true));
        let manager = manager(&mock, ProtocolConfig::immediate());
        let err = manager
            .load_script_lines("foo", &["x = 1"], true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, TspError::Transport(_)));

        let writes = mock.writes();
        assert!(!writes.iter().any(|w| w.starts_with("loadscript")));
        assert!(writes.ends_with(&[
            syntax::show_errors_command(true),
            syntax::show_prompts_command(true),
            syntax::show_errors_command(false),
            syntax::show_prompts_command(false),
        ]));
        assert_eq!(manager.interactive().show_errors(), Some(false));
        assert!(!manager.session().prompts_enabled());
    }

    #[tokio::test]
    async fn test_retain_outline_per_load() {
        let mock = MockInstrument::new();
        let manager = manager(&mock, ProtocolConfig::immediate());
        let body = ["if x then", "\ty = 1", "end"];

        let flat = manager
            .load_lines_with("foo", &body, LoadOptions::new(false, false))
            .await
            .unwrap();
        assert_eq!(flat.trimmed, vec!["if x then", "y = 1", "end"]);

        let outlined = manager
            .load_lines_with(
                "foo",
                &body,
                LoadOptions::new(false, false).with_retain_outline(true),
            )
            .await
            .unwrap();
        assert_eq!(outlined.trimmed, vec!["if x then", "    y = 1", "end"]);
        assert!(mock.writes().contains(&"    y = 1 ".to_string()));
    }
}
