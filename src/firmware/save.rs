//! Script save protocol and boot script sequencing.

use super::{BatchOutcome, FirmwareManager, ItemOutcome};
use crate::error::{TspError, TspResult};
use crate::node::NodeEntity;
use crate::script::{ScriptEntity, ScriptEntityCollection};
use crate::subsystem::ExecutionState;
use tokio::time::sleep;
use tracing::{error, info, warn};

impl FirmwareManager {
    /// Saves a loaded script to the non-volatile memory of `node`.
    ///
    /// The boot script is saved with autorun set. Saving any other script
    /// marks the node as needing its boot script saved again. Scripts flagged
    /// for byte code are converted first with the node's converter.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the script object is nil on the node.
    pub async fn save_script(
        &self,
        script: &mut ScriptEntity,
        node: &mut NodeEntity,
    ) -> TspResult<bool> {
        script.script.validate()?;
        let session = self.session();
        let _scope = session.node_scope(node.number);
        let name = script.script.name.clone();

        if node.is_nil(session, &name).await? {
            return Err(TspError::InvalidOperation {
                last_action: session.last_action(),
                execution_state: ExecutionState::Unknown,
                detail: format!("'{name}' is not loaded on node {}", node.number),
            });
        }

        let autorun = script.script.is_boot_script;
        if !autorun {
            node.boot_script_save_required = true;
        }
        if script.script.convert_to_byte_code {
            script.reset_save_state();
            self.announce(&format!("Converting {name}")).await;
            if !node
                .converter()
                .convert(session, node, &name, self.config())
                .await?
            {
                warn!(script = %name, node = node.number, "byte code conversion did not complete");
                script.saved = false;
                return Ok(false);
            }
        }

        self.announce(&format!("Saving {name}")).await;
        session.set_last_action(format!("saving '{name}' on node {}", node.number));
        let completed = self
            .execute_with_completion(&node.save_command(&name, autorun))
            .await?;
        if completed && autorun {
            node.boot_script_save_required = false;
        }
        script.saved = completed;
        info!(script = %name, node = node.number, autorun, byte_code = script.script.convert_to_byte_code, "saved script");
        Ok(completed)
    }

    /// Saves every loaded, unsaved script of `scripts`, boot script last.
    ///
    /// When any script was converted to byte code the node is reset
    /// afterwards. When everything succeeded the boot script is run and given
    /// the configured grace period. Script state is read back before and
    /// after the pass.
    pub async fn save_user_scripts(
        &self,
        scripts: &mut ScriptEntityCollection,
        node: &mut NodeEntity,
    ) -> TspResult<BatchOutcome> {
        if scripts.node_number() != node.number {
            return Err(TspError::InvalidArgument(format!(
                "collection tracks node {}, not node {}",
                scripts.node_number(),
                node.number
            )));
        }
        self.read_scripts_state(scripts, node).await?;

        let mut outcome = BatchOutcome::default();
        let mut reset_required = false;
        for item in scripts
            .iter_mut()
            .filter(|s| !s.script.is_boot_script && s.loaded && !s.saved)
        {
            reset_required |= item.script.convert_to_byte_code;
            outcome.items.push(self.save_item(item, node).await?);
        }

        let boot_required = node.boot_script_save_required;
        if let Some(boot) = scripts
            .iter_mut()
            .find(|s| s.script.is_boot_script && s.loaded && (!s.saved || boot_required))
        {
            reset_required |= boot.script.convert_to_byte_code;
            outcome.items.push(self.save_item(boot, node).await?);
        }

        if reset_required {
            outcome.reset = Some(self.reset_after_save(node).await?);
        }
        outcome.success =
            outcome.items.iter().all(|i| i.success) && outcome.reset.unwrap_or(true);

        if outcome.success {
            if let Some(boot) = scripts.boot_script().filter(|s| s.loaded) {
                let name = boot.name().to_string();
                match self.run_script(node, &name).await {
                    Ok(()) => sleep(self.config().boot_script_grace()).await,
                    Err(e) if e.is_absorbable() => {
                        error!(script = %name, node = node.number, error = %e, "boot script run failed");
                        outcome.success = false;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.read_scripts_state(scripts, node).await?;
        info!(
            node = node.number,
            saved = outcome.items.iter().filter(|i| i.success).count(),
            failed = outcome.failures().count(),
            reset = ?outcome.reset,
            success = outcome.success,
            "save pass finished"
        );
        Ok(outcome)
    }

    async fn save_item(&self, item: &mut ScriptEntity, node: &mut NodeEntity) -> TspResult<ItemOutcome> {
        let name = item.name().to_string();
        match self.save_script(item, node).await {
            Ok(true) => Ok(ItemOutcome::succeeded(&name, node.number)),
            Ok(false) => Ok(ItemOutcome::failed(&name, node.number, "save did not complete")),
            Err(e) if e.is_absorbable() => {
                error!(script = %name, node = node.number, error = %e, "save failed");
                Ok(ItemOutcome::failed(&name, node.number, e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Resets the node; failures are logged and reported as `false`.
    async fn reset_after_save(&self, node: &NodeEntity) -> TspResult<bool> {
        let session = self.session();
        let _scope = session.node_scope(node.number);
        session.set_last_action(format!("resetting node {}", node.number));
        let result: TspResult<()> = async {
            session.write_line(&node.reset_command()).await?;
            session.query_and_throw_if_operation_incomplete().await
        }
        .await;
        match result {
            Ok(()) => {
                info!(node = node.number, "node reset");
                Ok(true)
            }
            Err(e) if e.is_absorbable() => {
                warn!(node = node.number, error = %e, "reset failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolConfig, SessionConfig};
    use crate::script::FirmwareScript;
    use crate::session::{MockInstrument, TspSession};

    fn manager(mock: &MockInstrument) -> FirmwareManager {
        FirmwareManager::new(
            TspSession::new(mock.clone(), SessionConfig::immediate()),
            ProtocolConfig::immediate(),
        )
    }

    #[tokio::test]
    async fn test_save_nil_script_is_invalid_operation() {
        let mock = MockInstrument::new();
        let mut node = NodeEntity::controller(1, "2612B");
        let mut script = ScriptEntity::new(FirmwareScript::new("foo", "foo.tsp", "/fw"), 1);
        let err = manager(&mock)
            .save_script(&mut script, &mut node)
            .await
            .unwrap_err();
        assert!(matches!(err, TspError::InvalidOperation { .. }));
        assert!(!node.boot_script_save_required);
    }

    #[tokio::test]
    async fn test_boot_script_bookkeeping() {
        let mock = MockInstrument::new();
        mock.add_script(1, "lib", &["x=1"], false);
        mock.add_script(1, "boot", &["y=1"], false);
        let manager = manager(&mock);
        let mut node = NodeEntity::controller(1, "2612B");

        let mut lib = ScriptEntity::new(FirmwareScript::new("lib", "lib.tsp", "/fw"), 1);
        assert!(manager.save_script(&mut lib, &mut node).await.unwrap());
        assert!(node.boot_script_save_required);

        let mut boot_script = FirmwareScript::new("boot", "boot.tsp", "/fw");
        boot_script.is_boot_script = true;
        let mut boot = ScriptEntity::new(boot_script, 1);
        assert!(manager.save_script(&mut boot, &mut node).await.unwrap());
        assert!(!node.boot_script_save_required);
        assert!(mock.script(1, "boot").unwrap().autorun);
        assert!(!mock.script(1, "lib").unwrap().autorun);
    }

    #[tokio::test]
    async fn test_remote_reset_command() {
        let mock = MockInstrument::new();
        mock.add_node(2, "2612B");
        let node = NodeEntity::new(2, 1, "2612B", None);
        assert!(manager(&mock).reset_after_save(&node).await.unwrap());
        assert_eq!(mock.resets(), 1);
    }
}
