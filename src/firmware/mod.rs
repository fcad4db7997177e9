//! Firmware deployment protocols.
//!
//! [`FirmwareManager`] drives the three script protocols over one
//! [`TspSession`]:
//! - [`load`]: stream a source file into a named script on the controller
//! - [`upload`]: copy a controller script, or a byte-code file, to a remote node
//! - [`save`]: persist scripts to non-volatile memory and sequence boot scripts
//!
//! Batch operations never stop at the first failing script. Device,
//! transport and timeout failures are recorded per item in a
//! [`BatchOutcome`] and logged; argument errors still propagate.

pub mod load;
pub mod save;
pub mod upload;

use crate::config::ProtocolConfig;
use crate::error::{ensure_not_blank, TspError, TspResult};
use crate::node::NodeEntity;
use crate::script::{ScriptEntity, ScriptEntityCollection};
use crate::session::{syntax, TspSession};
use crate::subsystem::{ExecutionState, InteractiveSubsystem, NoDisplay, StatusDisplay};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a bounded wait does when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Log and carry on as if the wait had completed.
    Ignore,
    /// Log and report the operation as failed.
    ReturnFailure,
    /// Fail with [`TspError::Timeout`].
    #[default]
    #[serde(alias = "raise")]
    RaiseTimeoutError,
}

impl TimeoutPolicy {
    /// Resolves the outcome of a wait.
    ///
    /// Returns `Ok(true)` when the wait completed or the expiry is ignored,
    /// `Ok(false)` when it expired under `ReturnFailure`.
    pub fn apply(self, completed: bool, action: &str, timeout: Duration) -> TspResult<bool> {
        if completed {
            return Ok(true);
        }
        match self {
            Self::Ignore => {
                warn!(action, ?timeout, "wait expired, ignored");
                Ok(true)
            }
            Self::ReturnFailure => {
                warn!(action, ?timeout, "wait expired");
                Ok(false)
            }
            Self::RaiseTimeoutError => Err(TspError::Timeout {
                action: action.to_string(),
                timeout,
            }),
        }
    }
}

/// Outcome of one script in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Script name.
    pub name: String,
    /// Node the script was processed on.
    pub node: u32,
    /// Whether the step succeeded.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
}

impl ItemOutcome {
    fn succeeded(name: &str, node: u32) -> Self {
        Self {
            name: name.to_string(),
            node,
            success: true,
            error: None,
        }
    }

    fn failed(name: &str, node: u32, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            node,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Per-item outcomes of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// One entry per processed script.
    pub items: Vec<ItemOutcome>,
    /// Outcome of the post-batch reset, when one was needed.
    pub reset: Option<bool>,
    /// Every item succeeded, and the reset too when one was issued.
    pub success: bool,
}

impl BatchOutcome {
    /// Items that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| !i.success)
    }
}

/// Drives the script protocols over one session.
pub struct FirmwareManager {
    session: TspSession,
    interactive: InteractiveSubsystem,
    display: Box<dyn StatusDisplay>,
    config: ProtocolConfig,
}

impl FirmwareManager {
    /// Creates a manager without operator display.
    pub fn new(session: TspSession, config: ProtocolConfig) -> Self {
        Self {
            session,
            interactive: InteractiveSubsystem::new(),
            display: Box::new(NoDisplay),
            config,
        }
    }

    /// Sends progress lines to `display`.
    pub fn with_display(mut self, display: impl StatusDisplay + 'static) -> Self {
        self.display = Box::new(display);
        self
    }

    /// Underlying session.
    pub fn session(&self) -> &TspSession {
        &self.session
    }

    /// Interactive subsystem state.
    pub fn interactive(&self) -> &InteractiveSubsystem {
        &self.interactive
    }

    /// Protocol configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Shows a progress line; display failures are only logged.
    async fn announce(&self, text: &str) {
        if let Err(e) = self.display.display_line(&self.session, 1, text).await {
            warn!(error = %e, "display update failed");
        }
    }

    /// Writes a command ending in the completion sentinel and waits for it.
    ///
    /// Device errors take precedence over an expired wait.
    async fn execute_with_completion(&self, command: &str) -> TspResult<bool> {
        self.session.write_line(command).await?;
        let timeout = self.config.operation_completion_timeout();
        let completion = self.session.await_operation_completed_reply(timeout).await?;
        if !completion.completed {
            self.session.throw_device_exception_if_error().await?;
        }
        self.config
            .timeout_policy
            .apply(completion.completed, &self.session.last_action(), timeout)
    }

    /// Assigns nil to `name` on the controller unless it already is nil.
    pub async fn nill_object(&self, name: &str) -> TspResult<()> {
        ensure_not_blank("name", name)?;
        if self.session.is_nil(name).await? {
            debug!(object = name, "already nil");
            return Ok(());
        }
        self.session.set_last_action(format!("removing '{name}'"));
        self.execute_with_completion(&syntax::nil_command(name)).await?;
        self.ensure_removed(name, self.session.is_nil(name).await?)
    }

    /// Assigns nil to `name` on `node` unless it already is nil.
    pub async fn nill_object_on_node(&self, node: &NodeEntity, name: &str) -> TspResult<()> {
        ensure_not_blank("name", name)?;
        let _scope = self.session.node_scope(node.number);
        if node.is_nil(&self.session, name).await? {
            debug!(object = name, node = node.number, "already nil");
            return Ok(());
        }
        self.session
            .set_last_action(format!("removing '{name}' on node {}", node.number));
        self.execute_with_completion(&node.nil_command(name)).await?;
        self.ensure_removed(name, node.is_nil(&self.session, name).await?)
    }

    fn ensure_removed(&self, name: &str, nil: bool) -> TspResult<()> {
        if nil {
            info!(object = name, "removed");
            Ok(())
        } else {
            Err(TspError::InvalidOperation {
                last_action: self.session.last_action(),
                execution_state: ExecutionState::Unknown,
                detail: format!("'{name}' is still defined"),
            })
        }
    }

    /// Runs a script on its node.
    pub async fn run_script(&self, node: &NodeEntity, name: &str) -> TspResult<()> {
        ensure_not_blank("name", name)?;
        let _scope = self.session.node_scope(node.number);
        self.session
            .set_last_action(format!("running '{name}' on node {}", node.number));
        let command = if node.is_controller() {
            syntax::run_script_command(name)
        } else {
            syntax::execute_on_node(node.number, &format!("{name}.run()"))
        };
        self.session.write_line(&command).await?;
        self.session.throw_device_exception_if_error().await?;
        info!(script = name, node = node.number, "ran script");
        Ok(())
    }

    /// Re-reads the state of every script in `scripts` from `node`.
    pub async fn read_scripts_state(
        &self,
        scripts: &mut ScriptEntityCollection,
        node: &NodeEntity,
    ) -> TspResult<()> {
        scripts.read_scripts_state(&self.session, node).await
    }

    /// Copies the source of a controller script into `folder`.
    ///
    /// Expects prompts to be off.
    pub async fn export_script(&self, script: &mut ScriptEntity, folder: &Path) -> TspResult<PathBuf> {
        script.script.validate()?;
        let name = script.script.name.clone();
        self.session.set_last_action(format!("exporting '{name}'"));
        self.session
            .write_line(&syntax::print_source_command(&name))
            .await?;
        self.session.throw_device_exception_if_error().await?;

        let reply = self.session.read_line_trim_end().await?;
        let Some(count) = parse_line_count(&reply) else {
            self.session.flush_quietly().await;
            return Err(TspError::Parse {
                query: syntax::print_source_command(&name),
                reply,
            });
        };
        let mut lines = Vec::with_capacity(count.min(EXPORT_PREALLOCATED_LINES));
        for _ in 0..count {
            lines.push(self.session.read_line_trim_end().await?);
        }

        tokio::fs::create_dir_all(folder).await?;
        let path = folder.join(&script.script.file_name);
        let mut text = lines.join("\n");
        text.push('\n');
        tokio::fs::write(&path, text).await?;
        script.script.exported_to_file = true;
        info!(script = %name, path = %path.display(), lines = count, "exported script");
        Ok(path)
    }
}

/// Line counts above this are read without preallocation.
const EXPORT_PREALLOCATED_LINES: usize = 4096;

/// Largest line count accepted from a source listing.
const MAX_EXPORT_LINES: usize = 1 << 20;

/// Parses a line count printed by the instrument, `12` or `1.2e1`.
fn parse_line_count(reply: &str) -> Option<usize> {
    let value = reply.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > MAX_EXPORT_LINES as f64 {
        return None;
    }
    usize::try_from(value as u64).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::script::FirmwareScript;
    use crate::session::MockInstrument;

    fn manager(mock: &MockInstrument) -> FirmwareManager {
        FirmwareManager::new(
            TspSession::new(mock.clone(), SessionConfig::immediate()),
            ProtocolConfig::immediate(),
        )
    }

    #[test]
    fn test_timeout_policy() {
        let t = Duration::from_millis(5);
        assert!(TimeoutPolicy::Ignore.apply(false, "x", t).unwrap());
        assert!(!TimeoutPolicy::ReturnFailure.apply(false, "x", t).unwrap());
        assert!(matches!(
            TimeoutPolicy::RaiseTimeoutError.apply(false, "x", t),
            Err(TspError::Timeout { .. })
        ));
        assert!(TimeoutPolicy::RaiseTimeoutError.apply(true, "x", t).unwrap());
    }

    #[tokio::test]
    async fn test_nill_object_removes_global() {
        let mock = MockInstrument::new();
        mock.define(1, "foo");
        let manager = manager(&mock);
        manager.nill_object("foo").await.unwrap();
        assert!(!mock.is_defined(1, "foo"));
    }

    #[tokio::test]
    async fn test_nill_object_on_node() {
        let mock = MockInstrument::new();
        mock.add_node(2, "2612B");
        mock.define(2, "foo");
        let manager = manager(&mock);
        let node = NodeEntity::new(2, 1, "2612B", None);
        manager.nill_object_on_node(&node, "foo").await.unwrap();
        assert!(!mock.is_defined(2, "foo"));
        assert_eq!(manager.session().last_node_number(), None);
    }

    #[tokio::test]
    async fn test_nill_object_rejects_blank_name() {
        let mock = MockInstrument::new();
        let manager = manager(&mock);
        assert!(matches!(
            manager.nill_object(" ").await,
            Err(TspError::InvalidArgument(_))
        ));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_run_script_surfaces_device_error() {
        let mock = MockInstrument::new();
        let manager = manager(&mock);
        let node = NodeEntity::controller(1, "2612B");
        let err = manager.run_script(&node, "missing").await.unwrap_err();
        assert!(matches!(err, TspError::Device { .. }));
    }

    #[tokio::test]
    async fn test_export_script() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockInstrument::new();
        mock.add_script(1, "foo", &["x = 1", "print(x)"], false);
        let manager = manager(&mock);
        let mut entity = ScriptEntity::new(FirmwareScript::new("foo", "foo.tsp", dir.path()), 1);
        let path = manager.export_script(&mut entity, dir.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x = 1\nprint(x)\n");
        assert!(entity.script.exported_to_file);
    }

    #[test]
    fn test_parse_line_count() {
        assert_eq!(parse_line_count("2"), Some(2));
        assert_eq!(parse_line_count(" 1.2e1 "), Some(12));
        assert_eq!(parse_line_count("0"), Some(0));
        for bogus in ["1e30", "-1", "2.5", "nan", "inf", "two", ""] {
            assert_eq!(parse_line_count(bogus), None, "{bogus}");
        }
    }

    #[tokio::test]
    async fn test_export_rejects_garbled_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockInstrument::new();
        mock.add_script(1, "foo", &["x = 1"], false);
        mock.reply_to("string.gmatch(foo.source", &["1e30"]);
        let manager = manager(&mock);
        let mut entity = ScriptEntity::new(FirmwareScript::new("foo", "foo.tsp", dir.path()), 1);

        let err = manager.export_script(&mut entity, dir.path()).await.unwrap_err();
        match err {
            TspError::Parse { reply, .. } => assert_eq!(reply, "1e30"),
            other => panic!("unexpected error {other}"),
        }
        assert!(!entity.script.exported_to_file);
        assert!(!dir.path().join("foo.tsp").exists());
    }
}
