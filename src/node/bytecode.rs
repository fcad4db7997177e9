//! Byte-code conversion strategies.
//!
//! Series 2600 and 3700 firmware converts a script in place: dropping its
//! source leaves the compiled chunk behind. Other families need an explicit
//! converter function, itself a TSP script that is loaded on demand from an
//! embedded resource (selected by firmware version) or from a file.

use super::NodeEntity;
use crate::chunk::ChunkLineReader;
use crate::config::ProtocolConfig;
use crate::error::{TspError, TspResult};
use crate::session::{syntax, TspSession};
use crate::subsystem::interactive::{ExecutionState, InteractiveSubsystem};
use crate::subsystem::version::FirmwareVersion;
use crate::subsystem::InstrumentModelFamily;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Converter functions embedded in the binary, oldest firmware first.
const EMBEDDED_CONVERTERS: &[(&str, &str)] = &[
    ("1.6.0", include_str!("../../resources/bytecode/isr_bytecode_1.6.0.tsp")),
    ("1.7.0", include_str!("../../resources/bytecode/isr_bytecode_1.7.0.tsp")),
];

/// Function the embedded converters define.
pub const EMBEDDED_CONVERTER_FUNCTION: &str = "isr_bytecode.convert";

/// Script name the converter is loaded under.
const CONVERTER_SCRIPT_NAME: &str = "isr_bytecode_loader";

/// Turns a loaded script into byte code on its node.
#[async_trait]
pub trait ByteCodeConverter: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// Converts `script_name` on `node`.
    ///
    /// Returns `false` when a load the conversion depends on did not
    /// complete and `config.timeout_policy` asks for a failure report.
    async fn convert(
        &self,
        session: &TspSession,
        node: &NodeEntity,
        script_name: &str,
        config: &ProtocolConfig,
    ) -> TspResult<bool>;
}

/// Picks the strategy for a model family.
pub fn converter_for(
    family: InstrumentModelFamily,
    firmware_version: Option<FirmwareVersion>,
) -> Arc<dyn ByteCodeConverter> {
    match family {
        InstrumentModelFamily::K2600 | InstrumentModelFamily::K3700 => Arc::new(InPlaceNilReconstruct),
        _ => Arc::new(ExplicitConverterFunction::embedded(firmware_version)),
    }
}

/// Drops the script source so only the compiled chunk remains.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlaceNilReconstruct;

#[async_trait]
impl ByteCodeConverter for InPlaceNilReconstruct {
    fn name(&self) -> &'static str {
        "in_place_nil_reconstruct"
    }

    async fn convert(
        &self,
        session: &TspSession,
        node: &NodeEntity,
        script_name: &str,
        _config: &ProtocolConfig,
    ) -> TspResult<bool> {
        session.set_last_action(format!("converting '{script_name}' to byte code on node {}", node.number));
        let command = if node.is_controller() {
            syntax::nil_source_command(script_name)
        } else {
            syntax::nil_source_on_node_command(node.number, script_name)
        };
        session.write_line(&command).await?;
        session.throw_device_exception_if_error().await?;
        Ok(true)
    }
}

/// Where the converter script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterSource {
    /// Embedded resource for the given firmware version; latest if unknown.
    Embedded(Option<FirmwareVersion>),
    /// Script file on disk.
    File(PathBuf),
}

impl ConverterSource {
    /// Reads the converter source text.
    pub async fn read(&self) -> TspResult<String> {
        match self {
            Self::Embedded(version) => embedded_converter(version.as_ref()).map(str::to_string),
            Self::File(path) => {
                if !path.exists() {
                    return Err(TspError::FileNotFound(path.clone()));
                }
                Ok(tokio::fs::read_to_string(path).await?)
            }
        }
    }
}

/// Newest embedded converter not newer than `version`.
pub fn embedded_converter(version: Option<&FirmwareVersion>) -> TspResult<&'static str> {
    let candidates = EMBEDDED_CONVERTERS
        .iter()
        .filter_map(|(v, text)| FirmwareVersion::parse(v).map(|v| (v, *text)));
    let selected = match version {
        Some(version) => candidates.filter(|(v, _)| v <= version).max_by(|a, b| a.0.cmp(&b.0)),
        None => candidates.max_by(|a, b| a.0.cmp(&b.0)),
    };
    selected.map(|(_, text)| text).ok_or_else(|| {
        TspError::InvalidArgument(format!(
            "no byte code converter for firmware {}",
            version.map_or_else(|| "?".to_string(), ToString::to_string)
        ))
    })
}

/// Calls a converter function, loading it first when it is not resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitConverterFunction {
    /// Fully qualified converter function.
    pub function: String,
    /// Converter script source.
    pub source: ConverterSource,
}

impl ExplicitConverterFunction {
    /// Embedded converter for `firmware_version`.
    pub fn embedded(firmware_version: Option<FirmwareVersion>) -> Self {
        Self {
            function: EMBEDDED_CONVERTER_FUNCTION.to_string(),
            source: ConverterSource::Embedded(firmware_version),
        }
    }

    /// Converter defined by a script file.
    pub fn from_file(function: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            function: function.to_string(),
            source: ConverterSource::File(path.into()),
        }
    }

    /// Loads and runs the converter script unless its function is resident.
    ///
    /// Every line is checked for `IdleError` as it is streamed. The load
    /// completion wait uses the configured timeout and policy; `false` means
    /// the load did not complete and the policy reported it.
    async fn install(&self, session: &TspSession, config: &ProtocolConfig) -> TspResult<bool> {
        if !session.is_nil(&self.function).await? {
            return Ok(true);
        }
        let text = self.source.read().await?;
        info!(function = %self.function, "loading byte code converter");

        let loaded = self.load_converter(session, &text, config).await;
        if loaded.is_err() {
            session.flush_quietly().await;
        }
        if !loaded? {
            warn!(function = %self.function, "byte code converter load did not complete");
            return Ok(false);
        }

        session.set_last_action(format!("running byte code converter '{}'", self.function));
        session
            .write_line(&syntax::run_script_command(CONVERTER_SCRIPT_NAME))
            .await?;
        session.throw_device_exception_if_error().await?;

        if session.is_nil(&self.function).await? {
            return Err(TspError::InvalidOperation {
                last_action: session.last_action(),
                execution_state: ExecutionState::Unknown,
                detail: format!("converter function '{}' is nil after loading", self.function),
            });
        }
        debug!(function = %self.function, "byte code converter resident");
        Ok(true)
    }

    async fn load_converter(
        &self,
        session: &TspSession,
        text: &str,
        config: &ProtocolConfig,
    ) -> TspResult<bool> {
        let interactive = InteractiveSubsystem::new();
        session.set_last_action(format!("loading byte code converter '{}'", self.function));
        session
            .write_line(&syntax::load_script_command(CONVERTER_SCRIPT_NAME))
            .await?;
        interactive
            .ensure_not_idle_error(session, CONVERTER_SCRIPT_NAME)
            .await?;

        let mut reader = ChunkLineReader::new(false);
        for (index, line) in text.lines().enumerate() {
            let classified = reader.next_line(line);
            if !classified.content_type.is_syntax() || classified.live.is_empty() {
                continue;
            }
            session.set_last_action(format!(
                "loading byte code converter '{}' line {}",
                self.function,
                index + 1
            ));
            session.write_line(&format!("{} ", classified.live)).await?;
            interactive
                .ensure_not_idle_error(session, CONVERTER_SCRIPT_NAME)
                .await?;
        }

        session.write_line(&syntax::end_script_command()).await?;
        let timeout = config.load_completion_timeout();
        let completion = session.await_operation_completed_reply(timeout).await?;
        if !completion.completed {
            session.throw_device_exception_if_error().await?;
        }
        config
            .timeout_policy
            .apply(completion.completed, &session.last_action(), timeout)
    }
}

#[async_trait]
impl ByteCodeConverter for ExplicitConverterFunction {
    fn name(&self) -> &'static str {
        "explicit_converter_function"
    }

    async fn convert(
        &self,
        session: &TspSession,
        node: &NodeEntity,
        script_name: &str,
        config: &ProtocolConfig,
    ) -> TspResult<bool> {
        if !node.is_controller() {
            return Err(TspError::InvalidOperation {
                last_action: session.last_action(),
                execution_state: ExecutionState::Unknown,
                detail: format!(
                    "converter function '{}' can only convert scripts on the controller, not node {}",
                    self.function, node.number
                ),
            });
        }
        if !self.install(session, config).await? {
            return Ok(false);
        }
        session.set_last_action(format!("converting '{script_name}' with '{}'", self.function));
        session
            .write_line(&syntax::convert_with_function_command(&self.function, script_name))
            .await?;
        session.throw_device_exception_if_error().await?;
        Ok(true)
    }
}
