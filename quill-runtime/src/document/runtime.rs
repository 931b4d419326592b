//! Code package resolution and runtime transitions.
//!
//! When the quorum approves a new `code` value, inbound processing pauses,
//! every channel is stopped and reloaded from its final state under the new
//! package, then processing resumes. A failed transition leaves inbound
//! paused and reports the error; [`Document::retry_runtime_transition`]
//! tries again.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use quill_core::SnapshotTree;
use serde_json::Value;

use super::{Component, Document};
use crate::code::{load_code, Chaincode, CodeLoader};
use crate::error::DocumentError;
use crate::events::DocumentEvent;
use crate::options::DocumentOptions;
use crate::quorum::{ApprovedProposal, Quorum};
use crate::storage::{DocumentStorageService, RuntimeStorageService};

/// Quorum key naming the code package.
pub const CODE_KEY: &str = "code";

/// Package name carried by a `code` value.
fn package_name(value: &Value) -> String {
    match value {
        Value::String(package) => package.clone(),
        other => other.to_string(),
    }
}

/// Chaincode for a freshly loaded document.
///
/// Uses the agreed `code` value; snapshots that hold channels but predate
/// code proposals fall back to the legacy package; otherwise the null
/// runtime.
pub(crate) async fn load_code_from_quorum(
    loader: &dyn CodeLoader,
    quorum: &Quorum,
    tree: Option<&SnapshotTree>,
    options: &DocumentOptions,
) -> Result<Chaincode, DocumentError> {
    if let Some(value) = quorum.get(CODE_KEY) {
        return Ok(load_code(loader, &package_name(value)).await?);
    }
    let has_channels = tree.is_some_and(|t| !t.commits.is_empty() || !t.trees.is_empty());
    if has_channels {
        log::warn!(
            "snapshot has channels but no code proposal; using {}",
            options.legacy_code_package
        );
        return Ok(load_code(loader, &options.legacy_code_package).await?);
    }
    Ok(Chaincode::null())
}

impl Document {
    pub(crate) fn on_proposal_approved(&mut self, approval: ApprovedProposal) {
        if approval.key != CODE_KEY {
            return;
        }
        let package = package_name(&approval.value);
        log::info!(
            "{}: code proposal {} approved: {}",
            self.id,
            approval.sequence_number,
            package
        );
        self.delta_manager.pause_inbound();
        self.pending_transition = Some(package);
    }

    /// Run a pending transition, resuming inbound on success.
    pub(crate) async fn run_transition(&mut self, package: String) {
        match self.transition_runtime(&package).await {
            Ok(()) => {
                self.failed_transition = None;
                self.delta_manager.resume_inbound();
            }
            Err(error) => {
                self.failed_transition = Some(package);
                self.emit_error(error);
            }
        }
    }

    /// Re-attempt the last failed transition. Returns whether one was pending.
    pub async fn retry_runtime_transition(&mut self) -> Result<bool, DocumentError> {
        self.ensure_open()?;
        let Some(package) = self.failed_transition.take() else {
            return Ok(false);
        };
        self.run_transition(package).await;
        Ok(true)
    }

    /// Stop every channel, then reload each from its final state under
    /// `package`. Channels that fail to reload are not restored.
    async fn transition_runtime(&mut self, package: &str) -> Result<(), DocumentError> {
        if self.chaincode.package() == Some(package) {
            log::debug!("{}: already running {}", self.id, package);
            return Ok(());
        }
        let chaincode = load_code(self.code_loader.as_ref(), package).await?;

        let mut blobs = HashMap::new();
        let mut trees = Vec::with_capacity(self.components.len());
        for (address, component) in self.components.iter_mut() {
            let tree = component.stop()?;
            trees.push((address.clone(), tree.to_snapshot_tree(&mut blobs)?));
        }
        let storage: Arc<dyn DocumentStorageService> =
            Arc::new(RuntimeStorageService::new(self.storage.clone(), blobs));

        let loads = trees.iter().map(|(address, tree)| {
            let services = self.channel_services(address, storage.clone());
            Component::load(tree, &chaincode, services, Vec::new())
        });
        let reloaded = try_join_all(loads).await?;

        self.components = reloaded
            .into_iter()
            .map(|component| (component.address().to_string(), component))
            .collect();
        self.chaincode = chaincode;

        let addresses = self.addresses();
        log::info!(
            "{}: runtime switched to {} ({} channels)",
            self.id,
            package,
            addresses.len()
        );
        self.emit(DocumentEvent::RuntimeChanged(addresses));
        Ok(())
    }
}
