//! Interactive layer of the TSP command interface.
//!
//! The instrument can echo errors (`localnode.showerrors`) and print a prompt
//! after every chunk (`localnode.prompts`). The load protocol toggles both and
//! reads the [`ExecutionState`] after every line it streams.

use crate::error::{TspError, TspResult};
use crate::session::{is_prompt, status_byte, syntax, TspSession};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

/// Lines tolerated ahead of a prompt (error echoes, stray output).
const MAX_LINES_BEFORE_PROMPT: usize = 16;

/// Script-loading prompt state of the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionState {
    /// Idle and ready for a new chunk (`TSP>`).
    IdleReady,
    /// Accepting the continuation of a multi-line chunk (`>>>>`).
    IdleContinuation,
    /// The last chunk failed (`TSP?`).
    IdleError,
    /// Not determined.
    #[default]
    Unknown,
}

impl ExecutionState {
    /// Maps a prompt line to its state.
    pub fn from_prompt(line: &str) -> Self {
        match line.trim() {
            syntax::PROMPT_READY => Self::IdleReady,
            syntax::PROMPT_CONTINUATION => Self::IdleContinuation,
            syntax::PROMPT_ERROR => Self::IdleError,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::IdleReady => "idle ready",
            Self::IdleContinuation => "idle continuation",
            Self::IdleError => "idle error",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct Cache {
    show_errors: Option<bool>,
    show_prompts: Option<bool>,
    execution_state: ExecutionState,
}

/// Cached view of `localnode.showerrors`, `localnode.prompts` and the last
/// execution state.
#[derive(Debug, Default)]
pub struct InteractiveSubsystem {
    cache: Mutex<Cache>,
}

impl InteractiveSubsystem {
    /// Creates a subsystem with nothing cached.
    pub fn new() -> Self {
        Self::default()
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached show-errors value.
    pub fn show_errors(&self) -> Option<bool> {
        self.cache().show_errors
    }

    /// Cached prompts value.
    pub fn show_prompts(&self) -> Option<bool> {
        self.cache().show_prompts
    }

    /// Last execution state read.
    pub fn execution_state(&self) -> ExecutionState {
        self.cache().execution_state
    }

    /// Reads `localnode.showerrors` from the instrument.
    pub async fn read_show_errors(&self, session: &TspSession) -> TspResult<bool> {
        let on = session.query_int(syntax::SHOW_ERRORS_QUERY).await? != 0;
        self.cache().show_errors = Some(on);
        Ok(on)
    }

    /// Reads `localnode.prompts` and tells the session how to parse replies.
    pub async fn read_show_prompts(&self, session: &TspSession) -> TspResult<bool> {
        let on = session.query_int(syntax::SHOW_PROMPTS_QUERY).await? != 0;
        session.set_prompts_enabled(on);
        self.cache().show_prompts = Some(on);
        Ok(on)
    }

    /// Writes `localnode.showerrors`.
    pub async fn write_show_errors(&self, session: &TspSession, on: bool) -> TspResult<()> {
        session.write_line(&syntax::show_errors_command(on)).await?;
        self.cache().show_errors = Some(on);
        Ok(())
    }

    /// Writes `localnode.prompts`.
    pub async fn write_show_prompts(&self, session: &TspSession, on: bool) -> TspResult<()> {
        session.write_line(&syntax::show_prompts_command(on)).await?;
        session.set_prompts_enabled(on);
        self.cache().show_prompts = Some(on);
        Ok(())
    }

    /// Reads the execution state after a chunk was written.
    ///
    /// With prompts on the state is the next prompt line; anything printed
    /// ahead of it (error echoes) is skipped. With prompts off only an error
    /// can be observed, through the error-available bit, so the state is
    /// either `IdleError` or `IdleReady`.
    pub async fn read_execution_state(&self, session: &TspSession) -> TspResult<ExecutionState> {
        let state = if session.prompts_enabled() {
            let mut state = ExecutionState::Unknown;
            for _ in 0..MAX_LINES_BEFORE_PROMPT {
                let line = session.read_line_trim_end().await?;
                if is_prompt(&line) {
                    state = ExecutionState::from_prompt(&line);
                    break;
                }
                debug!(line = %line, "output ahead of prompt");
            }
            state
        } else {
            sleep(session.config().status_read_delay()).await;
            let status = session.read_status_byte().await?;
            if status & status_byte::ERROR_AVAILABLE != 0 {
                ExecutionState::IdleError
            } else {
                ExecutionState::IdleReady
            }
        };
        trace!(%state, "execution state");
        self.cache().execution_state = state;
        Ok(state)
    }

    /// Fails with `InvalidOperation`, carrying the device errors, when the
    /// instrument reports `IdleError` after a chunk of `script`.
    pub async fn ensure_not_idle_error(&self, session: &TspSession, script: &str) -> TspResult<()> {
        let state = self.read_execution_state(session).await?;
        if state != ExecutionState::IdleError {
            return Ok(());
        }
        let errors = match session.read_device_errors().await {
            Ok(errors) => errors,
            Err(e) => {
                warn!(error = %e, "failed to read device errors");
                Vec::new()
            }
        };
        let detail = if errors.is_empty() {
            format!("instrument rejected script '{script}'")
        } else {
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        let last_action = session.last_action();
        error!(action = %last_action, script, detail = %detail, "load aborted");
        Err(TspError::InvalidOperation {
            last_action,
            execution_state: state,
            detail,
        })
    }
}
