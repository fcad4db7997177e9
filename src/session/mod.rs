//! Session layer over a line-oriented instrument transport.
//!
//! The [`Transport`] trait is the leaf collaborator: it moves text lines and
//! reads the status byte. [`TspSession`] builds the synchronization
//! vocabulary the script protocols need on top of it: nil checks, device
//! error correlation, operation-completion waits and the scoped node context.
//!
//! All methods take `&self`; the transport sits behind a `tokio::sync::Mutex`
//! so a session can be shared by reference across the protocol helpers while
//! still issuing exactly one command at a time.

pub mod mock;
pub mod syntax;
pub mod tcp;

pub use mock::MockInstrument;
pub use tcp::TcpTransport;

use crate::config::SessionConfig;
use crate::error::{DeviceError, TspError, TspResult};
use crate::error_recovery::{retry_with, RetryPolicy};
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

/// Status byte bits used by the protocols.
pub mod status_byte {
    /// Error available (TSP error queue not empty).
    pub const ERROR_AVAILABLE: u8 = 0x04;
    /// Message available in the output queue.
    pub const MESSAGE_AVAILABLE: u8 = 0x10;
    /// Event summary bit (enabled standard event occurred).
    pub const EVENT_SUMMARY: u8 = 0x20;
    /// Master summary status / request service.
    pub const REQUESTING_SERVICE: u8 = 0x40;
}

/// Upper bound on error queue entries drained in one go.
const MAX_ERROR_QUEUE_READS: usize = 32;

/// Line-oriented byte channel to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Writes one command line; the terminator is appended by the transport.
    async fn write_line(&mut self, line: &str) -> TspResult<()>;

    /// Reads one reply line without its terminator.
    async fn read_line(&mut self) -> TspResult<String>;

    /// Reads the status byte.
    async fn read_status_byte(&mut self) -> TspResult<u8>;

    /// Drops any unread output, waiting at most `timeout` for stragglers.
    /// Returns the number of lines discarded.
    async fn discard_unread_data(&mut self, timeout: Duration) -> TspResult<usize>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

/// Result of an operation-completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationCompletion {
    /// Whether completion was observed before the timeout.
    pub completed: bool,
    /// Last status byte read.
    pub status_byte: u8,
    /// Time spent waiting.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct SessionState {
    last_action: String,
    last_node_number: Option<u32>,
    prompts_enabled: bool,
}

/// Synchronized command session with one TSP instrument.
pub struct TspSession {
    transport: Mutex<Box<dyn Transport>>,
    state: StdMutex<SessionState>,
    config: SessionConfig,
    retry: RetryPolicy,
}

impl TspSession {
    /// Creates a session over `transport`.
    pub fn new(transport: impl Transport + 'static, config: SessionConfig) -> Self {
        Self::from_boxed(Box::new(transport), config)
    }

    /// Creates a session over an already boxed transport.
    pub fn from_boxed(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let retry = config.retry.into();
        Self {
            transport: Mutex::new(transport),
            state: StdMutex::new(SessionState::default()),
            config,
            retry,
        }
    }

    /// Session timing configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a diagnostic breadcrumb describing what the session is doing.
    pub fn set_last_action(&self, action: impl Into<String>) {
        let action = action.into();
        trace!(action = %action, "last action");
        self.state().last_action = action;
    }

    /// The most recent breadcrumb.
    pub fn last_action(&self) -> String {
        self.state().last_action.clone()
    }

    /// Node the session is currently scoped to, if any.
    pub fn last_node_number(&self) -> Option<u32> {
        self.state().last_node_number
    }

    /// Scopes subsequent commands to `node` until the guard is dropped.
    ///
    /// The previous scope is restored on every exit path.
    pub fn node_scope(&self, node: u32) -> NodeScope<'_> {
        let previous = self.state().last_node_number.replace(node);
        NodeScope {
            session: self,
            previous,
        }
    }

    /// Whether the instrument is known to print prompts.
    pub fn prompts_enabled(&self) -> bool {
        self.state().prompts_enabled
    }

    /// Records the prompt setting last written to the instrument.
    pub fn set_prompts_enabled(&self, enabled: bool) {
        self.state().prompts_enabled = enabled;
    }

    /// Writes a command line, then honors the read-after-write delay.
    pub async fn write_line(&self, command: &str) -> TspResult<()> {
        debug!(command, node = ?self.last_node_number(), "write");
        self.transport.lock().await.write_line(command).await?;
        let delay = self.config.read_after_write_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(())
    }

    /// Writes several lines with `delay` between them.
    pub async fn write_lines(&self, lines: &[String], delay: Duration) -> TspResult<()> {
        for line in lines {
            self.write_line(line).await?;
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Reads one raw reply line.
    pub async fn read_line(&self) -> TspResult<String> {
        let line = self.transport.lock().await.read_line().await?;
        trace!(reply = %line, "read");
        Ok(line)
    }

    /// Reads one reply line with trailing whitespace removed.
    pub async fn read_line_trim_end(&self) -> TspResult<String> {
        Ok(self.read_line().await?.trim_end().to_string())
    }

    /// Reads the status byte.
    pub async fn read_status_byte(&self) -> TspResult<u8> {
        self.transport.lock().await.read_status_byte().await
    }

    /// Discards pending output.
    pub async fn discard_unread_data(&self, timeout: Duration) -> TspResult<usize> {
        let discarded = self
            .transport
            .lock()
            .await
            .discard_unread_data(timeout)
            .await?;
        if discarded > 0 {
            debug!(discarded, "discarded unread data");
        }
        Ok(discarded)
    }

    /// Best-effort flush used on error paths; failures are only logged.
    pub async fn flush_quietly(&self) {
        if let Err(e) = self.discard_unread_data(self.config.status_read_delay()).await {
            warn!(error = %e, "failed to discard unread data");
        }
    }

    /// Reads the next reply, skipping prompt lines when prompts are enabled.
    async fn read_reply(&self) -> TspResult<String> {
        let prompts = self.prompts_enabled();
        loop {
            let line = self.read_line_trim_end().await?;
            if prompts && is_prompt(&line) {
                continue;
            }
            if prompts {
                // The prompt that follows a reply belongs to this exchange.
                let trailing = self.read_line_trim_end().await?;
                if !is_prompt(&trailing) {
                    warn!(line = %trailing, "expected a prompt after the reply");
                }
            }
            return Ok(line);
        }
    }

    /// Writes a query and returns the trimmed reply.
    pub async fn query(&self, command: &str) -> TspResult<String> {
        self.write_line(command).await?;
        Ok(self.read_reply().await?.trim().to_string())
    }

    /// Writes a query and parses a Lua boolean reply, retrying garbled replies.
    pub async fn query_bool(&self, command: &str) -> TspResult<bool> {
        retry_with(&self.retry, is_parse_error, |attempt| async move {
            if attempt > 1 {
                self.flush_quietly().await;
            }
            let reply = self.query(command).await?;
            parse_bool(&reply).ok_or_else(|| TspError::Parse {
                query: command.to_string(),
                reply,
            })
        })
        .await
    }

    /// Writes a query and parses a numeric reply, retrying garbled replies.
    pub async fn query_int(&self, command: &str) -> TspResult<i64> {
        retry_with(&self.retry, is_parse_error, |attempt| async move {
            if attempt > 1 {
                self.flush_quietly().await;
            }
            let reply = self.query(command).await?;
            parse_number(&reply).ok_or_else(|| TspError::Parse {
                query: command.to_string(),
                reply,
            })
        })
        .await
    }

    /// True when `name` evaluates to nil on the controller.
    pub async fn is_nil(&self, name: &str) -> TspResult<bool> {
        self.query_bool(&syntax::is_nil_query(name)).await
    }

    /// True when `name` evaluates to nil on remote `node`.
    pub async fn is_nil_on_node(&self, node: u32, name: &str) -> TspResult<bool> {
        self.query_bool(&syntax::is_nil_on_node_query(node, name))
            .await
    }

    /// True when the status byte reports queued device errors.
    pub async fn error_available(&self) -> TspResult<bool> {
        Ok(self.read_status_byte().await? & status_byte::ERROR_AVAILABLE != 0)
    }

    /// Drains the instrument error queue.
    pub async fn read_device_errors(&self) -> TspResult<Vec<DeviceError>> {
        let count = self.query_int(syntax::ERROR_QUEUE_COUNT_QUERY).await?;
        let count = usize::try_from(count).unwrap_or(0).min(MAX_ERROR_QUEUE_READS);
        let mut errors = Vec::with_capacity(count);
        for _ in 0..count {
            let reply = self.query(syntax::ERROR_QUEUE_NEXT_QUERY).await?;
            match DeviceError::parse(&reply) {
                Some(e) if !e.is_no_error() => errors.push(e),
                Some(_) => break,
                None => warn!(reply = %reply, "unparsable error queue entry"),
            }
        }
        Ok(errors)
    }

    /// Fails with [`TspError::Device`] when the instrument reports errors.
    ///
    /// Pending output is discarded before the error is returned so the next
    /// caller starts from a clean transport.
    pub async fn throw_device_exception_if_error(&self) -> TspResult<()> {
        if !self.error_available().await? {
            return Ok(());
        }
        let errors = self.read_device_errors().await?;
        self.flush_quietly().await;
        let last_action = self.last_action();
        error!(action = %last_action, errors = errors.len(), "device reported errors");
        Err(TspError::Device {
            last_action,
            errors,
        })
    }

    /// Queries `*OPC?` and fails unless the sentinel comes back.
    pub async fn query_and_throw_if_operation_incomplete(&self) -> TspResult<()> {
        let reply = self.query(syntax::OPERATION_COMPLETED_QUERY).await?;
        if reply == syntax::OPERATION_COMPLETED_VALUE {
            return Ok(());
        }
        self.throw_device_exception_if_error().await?;
        Err(TspError::InvalidOperation {
            last_action: self.last_action(),
            execution_state: crate::subsystem::ExecutionState::Unknown,
            detail: format!("operation incomplete, '*OPC?' returned '{reply}'"),
        })
    }

    /// Makes `*OPC` raise a service request when pending operations finish.
    pub async fn enable_service_request_on_operation_completion(&self) -> TspResult<()> {
        self.write_line(syntax::STANDARD_EVENT_ENABLE_OPC).await?;
        self.write_line(syntax::SERVICE_REQUEST_ENABLE_ESB).await
    }

    /// Polls the status byte until the event summary or service request bit
    /// is set, or `timeout` expires.
    ///
    /// On completion the standard event register is read back to clear it.
    pub async fn await_operation_completion(
        &self,
        timeout: Duration,
    ) -> TspResult<OperationCompletion> {
        let started = Instant::now();
        let mask = status_byte::EVENT_SUMMARY | status_byte::REQUESTING_SERVICE;
        loop {
            let status = self.read_status_byte().await?;
            if status & mask != 0 {
                self.query(syntax::STANDARD_EVENT_STATUS_QUERY).await?;
                return Ok(OperationCompletion {
                    completed: true,
                    status_byte: status,
                    elapsed: started.elapsed(),
                });
            }
            if started.elapsed() >= timeout {
                return Ok(OperationCompletion {
                    completed: false,
                    status_byte: status,
                    elapsed: started.elapsed(),
                });
            }
            sleep(self.config.status_read_delay()).await;
        }
    }

    /// Sleep-and-recheck loop waiting for the operation-completed sentinel
    /// in the output queue.
    pub async fn await_operation_completed_reply(
        &self,
        timeout: Duration,
    ) -> TspResult<OperationCompletion> {
        let started = Instant::now();
        loop {
            sleep(self.config.status_read_delay()).await;
            let status = self.read_status_byte().await?;
            if status & status_byte::MESSAGE_AVAILABLE != 0 {
                let reply = self.read_line_trim_end().await?;
                if reply.trim() == syntax::OPERATION_COMPLETED_VALUE {
                    return Ok(OperationCompletion {
                        completed: true,
                        status_byte: status,
                        elapsed: started.elapsed(),
                    });
                }
                trace!(reply = %reply, "ignoring output while awaiting completion");
            }
            if started.elapsed() >= timeout {
                return Ok(OperationCompletion {
                    completed: false,
                    status_byte: status,
                    elapsed: started.elapsed(),
                });
            }
        }
    }

    /// Queries the instrument identity string.
    pub async fn identity(&self) -> TspResult<String> {
        self.query(syntax::IDENTITY_QUERY).await
    }
}

/// Scoped node context; restores the previous node number when dropped.
pub struct NodeScope<'a> {
    session: &'a TspSession,
    previous: Option<u32>,
}

impl Deref for NodeScope<'_> {
    type Target = TspSession;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl Drop for NodeScope<'_> {
    fn drop(&mut self) {
        self.session.state().last_node_number = self.previous;
    }
}

/// True for the three interactive prompts.
pub fn is_prompt(line: &str) -> bool {
    matches!(
        line.trim(),
        syntax::PROMPT_READY | syntax::PROMPT_CONTINUATION | syntax::PROMPT_ERROR
    )
}

fn is_parse_error(e: &TspError) -> bool {
    matches!(e, TspError::Parse { .. })
}

fn parse_bool(reply: &str) -> Option<bool> {
    match reply.trim() {
        "true" => Some(true),
        "false" | "nil" => Some(false),
        _ => None,
    }
}

fn parse_number(reply: &str) -> Option<i64> {
    let value = reply.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value as i64)
}
