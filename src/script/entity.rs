//! Runtime state of firmware scripts on one node.

use super::FirmwareScript;
use crate::error::TspResult;
use crate::node::NodeEntity;
use crate::session::TspSession;
use tracing::debug;

/// A firmware script and its state on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntity {
    /// Script metadata.
    pub script: FirmwareScript,
    /// Node the state refers to.
    pub node_number: u32,
    /// The script object exists on the node.
    pub loaded: bool,
    /// The script is in the node's saved catalog.
    pub saved: bool,
    /// The script's namespace is defined, i.e. it has been run.
    pub activated: bool,
}

impl ScriptEntity {
    /// Untracked script on `node_number`.
    pub fn new(script: FirmwareScript, node_number: u32) -> Self {
        Self {
            script,
            node_number,
            loaded: false,
            saved: false,
            activated: false,
        }
    }

    /// Script name.
    pub fn name(&self) -> &str {
        &self.script.name
    }

    /// Clears save and activation state; byte-code conversion invalidates both.
    pub fn reset_save_state(&mut self) {
        self.saved = false;
        self.activated = false;
    }

    /// Re-reads `loaded` and `activated` from the node.
    pub async fn read_state(&mut self, session: &TspSession, node: &NodeEntity) -> TspResult<()> {
        self.loaded = !node.is_nil(session, &self.script.name).await?;
        self.activated = if self.loaded && self.script.has_top_namespace() {
            !node.is_nil(session, &self.script.top_namespace).await?
        } else {
            false
        };
        Ok(())
    }
}

/// Ordered scripts of one node.
#[derive(Debug, Clone, Default)]
pub struct ScriptEntityCollection {
    node_number: u32,
    items: Vec<ScriptEntity>,
}

impl ScriptEntityCollection {
    /// Empty collection for `node_number`.
    pub fn new(node_number: u32) -> Self {
        Self {
            node_number,
            items: Vec::new(),
        }
    }

    /// Collection tracking `scripts` on `node_number`.
    pub fn from_scripts(node_number: u32, scripts: impl IntoIterator<Item = FirmwareScript>) -> Self {
        let mut collection = Self::new(node_number);
        for script in scripts {
            collection.push(script);
        }
        collection
    }

    /// Node the collection tracks.
    pub fn node_number(&self) -> u32 {
        self.node_number
    }

    /// Appends a script.
    pub fn push(&mut self, script: FirmwareScript) {
        self.items.push(ScriptEntity::new(script, self.node_number));
    }

    /// Scripts in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ScriptEntity> {
        self.items.iter()
    }

    /// Scripts in order, mutable.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ScriptEntity> {
        self.items.iter_mut()
    }

    /// Script by name.
    pub fn get(&self, name: &str) -> Option<&ScriptEntity> {
        self.items.iter().find(|s| s.name() == name)
    }

    /// Script by name, mutable.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ScriptEntity> {
        self.items.iter_mut().find(|s| s.name() == name)
    }

    /// Number of scripts.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True when every script is saved.
    pub fn all_saved(&self) -> bool {
        self.items.iter().all(|s| s.saved)
    }

    /// True when every script is loaded.
    pub fn all_loaded(&self) -> bool {
        self.items.iter().all(|s| s.loaded)
    }

    /// The designated boot script, if any.
    pub fn boot_script(&self) -> Option<&ScriptEntity> {
        self.items.iter().find(|s| s.script.is_boot_script)
    }

    /// Re-synchronizes loaded, saved and activated flags with the node.
    pub async fn read_scripts_state(&mut self, session: &TspSession, node: &NodeEntity) -> TspResult<()> {
        let _scope = session.node_scope(node.number);
        let catalog = node.saved_scripts(session).await?;
        for item in &mut self.items {
            item.read_state(session, node).await?;
            item.saved = catalog.contains(item.name());
            debug!(
                script = item.name(),
                node = node.number,
                loaded = item.loaded,
                saved = item.saved,
                activated = item.activated,
                "script state"
            );
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ScriptEntityCollection {
    type Item = &'a ScriptEntity;
    type IntoIter = std::slice::Iter<'a, ScriptEntity>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::MockInstrument;

    fn collection() -> ScriptEntityCollection {
        let mut support = FirmwareScript::new("support", "support.tsp", "/fw");
        support.top_namespace = "isr".to_string();
        ScriptEntityCollection::from_scripts(
            1,
            [support, FirmwareScript::new("extra", "extra.tsp", "/fw")],
        )
    }

    #[test]
    fn test_reset_save_state() {
        let mut entity = ScriptEntity::new(FirmwareScript::new("a", "a.tsp", "/fw"), 1);
        entity.saved = true;
        entity.activated = true;
        entity.reset_save_state();
        assert!(!entity.saved && !entity.activated);
    }

    #[tokio::test]
    async fn test_read_scripts_state() {
        let mock = MockInstrument::new();
        mock.add_script(1, "support", &["isr = {}"], true);
        mock.define(1, "isr");
        let session = TspSession::new(mock, SessionConfig::immediate());
        let node = NodeEntity::controller(1, "2612B");

        let mut scripts = collection();
        scripts.read_scripts_state(&session, &node).await.unwrap();

        let support = scripts.get("support").unwrap();
        assert!(support.loaded && support.saved && support.activated);
        let extra = scripts.get("extra").unwrap();
        assert!(!extra.loaded && !extra.saved);
        assert!(!scripts.all_saved());
        assert_eq!(session.last_node_number(), None);
    }
}
