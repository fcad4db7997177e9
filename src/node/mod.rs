//! TSP-Link node topology.
//!
//! A [`NodeEntity`] is one instrument on the TSP-Link bus. The controller is
//! the node the session talks to; every other node is reached through
//! `node[n]` on the controller. The byte-code conversion strategy is chosen
//! once, when the node is discovered.

pub mod bytecode;
pub mod smu;

pub use bytecode::{ByteCodeConverter, ConverterSource, ExplicitConverterFunction, InPlaceNilReconstruct};
pub use smu::{SmuAddress, SmuSubsystem, SmuUnit, SourceMeasureUnit, SourceMeasureUnitSubsystemCollection};

use crate::error::TspResult;
use crate::session::{syntax, TspSession};
use crate::subsystem::{InstrumentModelFamily, VersionInfo};
use crate::subsystem::version::FirmwareVersion;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One instrument on the TSP-Link bus.
#[derive(Clone)]
pub struct NodeEntity {
    /// One-based node number.
    pub number: u32,
    /// Node number of the controller.
    pub controller_number: u32,
    /// Model number, e.g. `2612B`.
    pub model: String,
    /// Family derived from the model.
    pub model_family: InstrumentModelFamily,
    /// A non-boot script was saved, so the boot script must be saved again.
    pub boot_script_save_required: bool,
    converter: Arc<dyn ByteCodeConverter>,
}

impl fmt::Debug for NodeEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEntity")
            .field("number", &self.number)
            .field("controller_number", &self.controller_number)
            .field("model", &self.model)
            .field("boot_script_save_required", &self.boot_script_save_required)
            .field("converter", &self.converter.name())
            .finish()
    }
}

impl NodeEntity {
    /// Creates a node, selecting the converter for its family.
    pub fn new(
        number: u32,
        controller_number: u32,
        model: &str,
        firmware_version: Option<FirmwareVersion>,
    ) -> Self {
        let model_family = InstrumentModelFamily::from_model(model);
        Self {
            number,
            controller_number,
            model: model.to_string(),
            model_family,
            boot_script_save_required: false,
            converter: bytecode::converter_for(model_family, firmware_version),
        }
    }

    /// The controller itself.
    pub fn controller(number: u32, model: &str) -> Self {
        Self::new(number, number, model, None)
    }

    /// Replaces the byte-code converter.
    pub fn with_converter(mut self, converter: Arc<dyn ByteCodeConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Byte-code converter selected for this node.
    pub fn converter(&self) -> &dyn ByteCodeConverter {
        self.converter.as_ref()
    }

    /// True for the node the session talks to directly.
    pub fn is_controller(&self) -> bool {
        self.number == self.controller_number
    }

    /// True when `name` is nil on this node.
    pub async fn is_nil(&self, session: &TspSession, name: &str) -> TspResult<bool> {
        if self.is_controller() {
            session.is_nil(name).await
        } else {
            session.is_nil_on_node(self.number, name).await
        }
    }

    /// Command assigning nil to `name` on this node.
    pub fn nil_command(&self, name: &str) -> String {
        if self.is_controller() {
            syntax::nil_command(name)
        } else {
            syntax::nil_on_node_command(self.number, name)
        }
    }

    /// Command saving `name` on this node.
    pub fn save_command(&self, name: &str, autorun: bool) -> String {
        if self.is_controller() {
            syntax::save_command(name, autorun)
        } else {
            syntax::save_on_node_command(self.number, name, autorun)
        }
    }

    /// Command resetting this node.
    pub fn reset_command(&self) -> String {
        if self.is_controller() {
            syntax::LOCAL_NODE_RESET_COMMAND.to_string()
        } else {
            syntax::reset_on_node_command(self.number)
        }
    }

    /// Names in the saved-script catalog of this node.
    pub async fn saved_scripts(&self, session: &TspSession) -> TspResult<BTreeSet<String>> {
        let query = if self.is_controller() {
            syntax::CATALOG_QUERY.to_string()
        } else {
            syntax::catalog_on_node_query(self.number)
        };
        let reply = session.query(&query).await?;
        Ok(parse_list(&reply).map(str::to_string).collect())
    }
}

fn parse_list(reply: &str) -> impl Iterator<Item = &str> {
    reply.split(',').map(str::trim).filter(|s| !s.is_empty() && *s != "nil")
}

/// Parses `number=model,` pairs.
fn parse_node_models(reply: &str) -> Vec<(u32, String)> {
    parse_list(reply)
        .filter_map(|pair| {
            let (number, model) = pair.split_once('=')?;
            let number = number.trim().parse::<f64>().ok()? as u32;
            Some((number, model.trim().to_string()))
        })
        .collect()
}

/// Discovers the controller and every populated TSP-Link node.
pub async fn discover_nodes(session: &TspSession) -> TspResult<Vec<NodeEntity>> {
    session.set_last_action("discovering TSP-Link nodes");
    let identity = VersionInfo::parse(&session.identity().await?)?;
    let controller = u32::try_from(session.query_int(syntax::CONTROLLER_NODE_QUERY).await?)
        .unwrap_or(1)
        .max(1);
    let models = parse_node_models(&session.query(syntax::NODE_MODELS_QUERY).await?);

    let mut nodes: Vec<NodeEntity> = models
        .into_iter()
        .map(|(number, model)| {
            NodeEntity::new(number, controller, &model, identity.firmware_version.clone())
        })
        .collect();

    if !nodes.iter().any(NodeEntity::is_controller) {
        warn!(controller, "controller missing from node list");
        nodes.insert(
            0,
            NodeEntity::new(
                controller,
                controller,
                &identity.model,
                identity.firmware_version.clone(),
            ),
        );
    }
    nodes.sort_by_key(|n| n.number);
    for node in &nodes {
        debug!(node = node.number, model = %node.model, converter = node.converter().name(), "node");
    }
    info!(controller, nodes = nodes.len(), "discovered TSP-Link nodes");
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::MockInstrument;

    #[test]
    fn test_parse_node_models() {
        assert_eq!(
            parse_node_models("1=2612B,3=2636B,"),
            vec![(1, "2612B".to_string()), (3, "2636B".to_string())]
        );
        assert!(parse_node_models("nil").is_empty());
    }

    #[test]
    fn test_commands_depend_on_controller() {
        let controller = NodeEntity::controller(1, "2612B");
        let remote = NodeEntity::new(3, 1, "2612B", None);
        assert!(controller.is_controller());
        assert!(!remote.is_controller());
        assert_eq!(controller.nil_command("foo"), syntax::nil_command("foo"));
        assert!(remote.nil_command("foo").starts_with("node[3].execute('foo=nil')"));
    }

    #[tokio::test]
    async fn test_discover_nodes() {
        let mock = MockInstrument::new();
        mock.add_node(2, "2450");
        let session = TspSession::new(mock, SessionConfig::immediate());
        let nodes = discover_nodes(&session).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].is_controller());
        assert_eq!(nodes[0].converter().name(), "in_place_nil_reconstruct");
        assert_eq!(nodes[1].model_family, InstrumentModelFamily::K2450);
        assert_eq!(nodes[1].converter().name(), "explicit_converter_function");
    }

    #[tokio::test]
    async fn test_saved_scripts_on_remote_node() {
        let mock = MockInstrument::new();
        mock.add_node(2, "2612B");
        mock.add_script(2, "bar", &["x=1"], true);
        let session = TspSession::new(mock, SessionConfig::immediate());
        let node = NodeEntity::new(2, 1, "2612B", None);
        let saved = node.saved_scripts(&session).await.unwrap();
        assert!(saved.contains("bar"));
    }
}
