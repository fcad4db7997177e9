//! Script upload protocol: controller script to a remote TSP-Link node.
//!
//! Source scripts travel through the remote node's data queue, or through
//! the resident upload helper when the support namespace is loaded. Binary
//! scripts are wrapped in a temporary loader that runs on the controller and
//! rebuilds the script on the node from its byte code. Either way the result
//! is verified on the node afterwards; a write that went through proves
//! nothing.

use super::{BatchOutcome, FirmwareManager, ItemOutcome};
use crate::error::{TspError, TspResult};
use crate::node::NodeEntity;
use crate::script::{ScriptEntity, ScriptEntityCollection};
use crate::session::syntax;
use crate::subsystem::ExecutionState;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

impl FirmwareManager {
    /// Copies `script` from the controller to `node` and verifies it there.
    ///
    /// Device, transport and timeout failures during the transfer are logged
    /// and reported as `Ok(false)`. `script.loaded` always reflects what the
    /// node reports after the attempt.
    pub async fn upload_script(
        &self,
        script: &mut ScriptEntity,
        node: &NodeEntity,
    ) -> TspResult<bool> {
        script.script.validate()?;
        if node.is_controller() {
            return Err(TspError::InvalidArgument(format!(
                "node {} is the controller; upload targets a remote node",
                node.number
            )));
        }
        let session = self.session();
        let _scope = session.node_scope(node.number);
        let name = script.script.name.clone();
        self.announce(&format!("Uploading {name} to node {}", node.number))
            .await;

        let attempt = if script.script.is_binary() {
            self.upload_binary(script, node).await
        } else {
            self.upload_source(&name, node).await
        };
        match attempt {
            Ok(true) => debug!(script = %name, node = node.number, "transfer sent"),
            Ok(false) => warn!(script = %name, node = node.number, "transfer did not complete"),
            Err(e) if e.is_absorbable() => {
                warn!(script = %name, node = node.number, error = %e, "upload failed");
            }
            Err(e) => return Err(e),
        }

        script.loaded = self.verify_upload(&name, node).await?;
        if script.loaded {
            info!(script = %name, node = node.number, "uploaded script");
        } else {
            warn!(script = %name, node = node.number, "script not found on node after upload");
        }
        Ok(script.loaded)
    }

    /// Uploads every script of `scripts` that `node` does not hold yet.
    ///
    /// Scripts already loaded on the node are skipped and not reported.
    pub async fn upload_user_scripts(
        &self,
        scripts: &mut ScriptEntityCollection,
        node: &NodeEntity,
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
        for item in scripts.iter_mut().filter(|s| !s.loaded) {
            let name = item.name().to_string();
            let result = match self.upload_script(item, node).await {
                Ok(true) => ItemOutcome::succeeded(&name, node.number),
                Ok(false) => ItemOutcome::failed(&name, node.number, "script not found on node"),
                Err(e) if e.is_absorbable() => {
                    error!(script = %name, node = node.number, error = %e, "upload failed");
                    ItemOutcome::failed(&name, node.number, e.to_string())
                }
                Err(e) => return Err(e),
            };
            outcome.items.push(result);
        }
        outcome.success = outcome.items.iter().all(|i| i.success);
        info!(
            node = node.number,
            uploaded = outcome.items.iter().filter(|i| i.success).count(),
            failed = outcome.failures().count(),
            "upload pass finished"
        );
        Ok(outcome)
    }

    async fn upload_source(&self, name: &str, node: &NodeEntity) -> TspResult<bool> {
        let session = self.session();
        if session.is_nil(name).await? {
            return Err(TspError::InvalidOperation {
                last_action: session.last_action(),
                execution_state: ExecutionState::Unknown,
                detail: format!("'{name}' is not loaded on the controller"),
            });
        }

        let config = self.config();
        if session.is_nil(&config.support_namespace).await? {
            self.clear_data_queue(node).await?;
            session.set_last_action(format!("queueing '{name}' source for node {}", node.number));
            session
                .write_line(&syntax::data_queue_add_source_command(node.number, name))
                .await?;
            session.set_last_action(format!("creating '{name}' on node {}", node.number));
            session
                .write_line(&syntax::script_new_from_data_queue_command(node.number, name))
                .await?;
            session.write_line(syntax::WAIT_COMPLETE_ALL_COMMAND).await?;
        } else {
            session.set_last_action(format!(
                "uploading '{name}' to node {} with '{}'",
                node.number, config.upload_helper
            ));
            session
                .write_line(&syntax::upload_helper_command(
                    &config.upload_helper,
                    node.number,
                    name,
                ))
                .await?;
        }
        session.throw_device_exception_if_error().await?;
        Ok(true)
    }

    async fn upload_binary(&self, script: &ScriptEntity, node: &NodeEntity) -> TspResult<bool> {
        let session = self.session();
        let name = script.name();
        let path = script.script.file_path();
        if !path.exists() {
            return Err(TspError::FileNotFound(path));
        }
        let byte_code: Vec<String> = tokio::fs::read_to_string(&path)
            .await?
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        session.enable_service_request_on_operation_completion().await?;
        self.clear_data_queue(node).await?;

        let loader = syntax::loader_script_name(name);
        let result = self.run_binary_loader(&loader, name, node, &byte_code).await;
        if let Err(e) = self.nill_object(&loader).await {
            warn!(loader = %loader, error = %e, "failed to remove loader");
        }
        result
    }

    async fn run_binary_loader(
        &self,
        loader: &str,
        name: &str,
        node: &NodeEntity,
        byte_code: &[String],
    ) -> TspResult<bool> {
        let session = self.session();
        session.set_last_action(format!("sending loader for '{name}' to node {}", node.number));
        let lines = syntax::binary_loader_lines(node.number, name, byte_code);
        session
            .write_lines(&lines, self.config().loader_line_delay())
            .await?;

        session.set_last_action(format!("running loader '{loader}'"));
        session
            .write_line(&syntax::run_script_command(loader))
            .await?;
        session
            .write_line(syntax::OPERATION_COMPLETE_COMMAND)
            .await?;
        let timeout = self.config().operation_completion_timeout();
        let completion = session.await_operation_completion(timeout).await?;
        debug!(loader, completed = completion.completed, elapsed = ?completion.elapsed, "loader finished");
        if !completion.completed {
            session.throw_device_exception_if_error().await?;
        }
        let completed = self
            .config()
            .timeout_policy
            .apply(completion.completed, &session.last_action(), timeout)?;
        session.throw_device_exception_if_error().await?;
        Ok(completed)
    }

    async fn clear_data_queue(&self, node: &NodeEntity) -> TspResult<()> {
        let session = self.session();
        if self.config().warn_on_stale_data_queue {
            let count = session
                .query_int(&syntax::data_queue_count_query(node.number))
                .await?;
            if count > 0 {
                warn!(node = node.number, count, "clearing stale data queue items");
            }
        }
        session.set_last_action(format!("clearing data queue of node {}", node.number));
        session
            .write_line(&syntax::data_queue_clear_command(node.number))
            .await
    }

    /// Waits for the short name on the node, then falls back to the long
    /// name and re-binds the short name to it.
    async fn verify_upload(&self, name: &str, node: &NodeEntity) -> TspResult<bool> {
        let session = self.session();
        let timeout = self.config().upload_verify_timeout();
        let started = Instant::now();
        loop {
            if !session.is_nil_on_node(node.number, name).await? {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                break;
            }
            sleep(session.config().status_read_delay()).await;
        }

        let long_name = syntax::user_script_long_name(name);
        if session.is_nil_on_node(node.number, &long_name).await? {
            warn!(script = name, node = node.number, ?timeout, "neither short nor long name resolves");
            return Ok(false);
        }
        session.set_last_action(format!("aliasing '{long_name}' on node {}", node.number));
        session
            .write_line(&syntax::alias_on_node_command(node.number, name))
            .await?;
        session.query_and_throw_if_operation_incomplete().await?;
        Ok(!session.is_nil_on_node(node.number, name).await?)
    }
}
