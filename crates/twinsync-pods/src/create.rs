//! First creation of a physical pod
//!
//! Runs when a virtual pod has no physical twin yet.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Toleration};
use kube::ResourceExt;
use tracing::{debug, info};
use twinsync_common::events::reasons;
use twinsync_common::Error;

use crate::client::DeleteOptions;
use crate::hostpath::rewrite_host_paths;
use crate::syncer::{
    is_terminating, node_name, PodSyncer, SyncResult, MISSING_NODE_RETRY,
    ZERO_GRACE_PERIOD_SECONDS,
};

/// Whether the pod has been started on a node before
fn has_started(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .is_some()
}

/// Append tolerations to a pod, keeping the ones it already has
pub fn apply_tolerations(pod: &mut Pod, tolerations: &[Toleration]) {
    if tolerations.is_empty() {
        return;
    }
    pod.spec
        .get_or_insert_with(Default::default)
        .tolerations
        .get_or_insert_with(Vec::new)
        .extend(tolerations.iter().cloned());
}

/// Merge labels into a pod's node selector; the given labels win on conflict
pub fn merge_node_selector(pod: &mut Pod, labels: &BTreeMap<String, String>) {
    pod.spec
        .get_or_insert_with(Default::default)
        .node_selector
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

impl PodSyncer {
    /// Create the physical twin of a virtual pod.
    ///
    /// A virtual pod that is already terminating, or that has run before,
    /// is not given a new physical pod. It is deleted immediately instead.
    /// Errors a user should see are also published as a `SyncError` event.
    pub async fn sync_down(&self, virtual_pod: &Pod) -> Result<SyncResult, Error> {
        let result = self.create_physical(virtual_pod).await;
        self.report(virtual_pod, result).await
    }

    async fn create_physical(&self, virtual_pod: &Pod) -> Result<SyncResult, Error> {
        if is_terminating(virtual_pod) || has_started(virtual_pod) {
            info!(
                pod = %virtual_pod.name_any(),
                namespace = %virtual_pod.namespace().unwrap_or_default(),
                "virtual pod has no physical pod and is terminating or has already run, deleting it"
            );
            self.delete_virtual(
                virtual_pod,
                &DeleteOptions::with_grace_period(ZERO_GRACE_PERIOD_SECONDS),
            )
            .await?;
            return Ok(SyncResult::Done);
        }

        if !self.pod_security_allows(virtual_pod).await? {
            return Ok(SyncResult::Done);
        }

        let mut physical = self.translator.translate(virtual_pod).await?;
        apply_tolerations(&mut physical, &self.options.tolerations);

        if let Some(selector) = &self.options.node_selector {
            let node = node_name(&physical).to_string();
            if node.is_empty() {
                merge_node_selector(&mut physical, selector);
            } else if self.virtual_client.get_node(&node).await?.is_none() {
                self.publish_warning(
                    virtual_pod,
                    reasons::SYNC_WARNING,
                    format!("Given nodeName {} does not exist in virtual cluster", node),
                )
                .await;
                return Ok(SyncResult::RequeueAfter(MISSING_NODE_RETRY));
            }
        }

        rewrite_host_paths(&mut physical, &self.options.virtual_logs_path);

        if self.options.enable_scheduler && node_name(&physical).is_empty() {
            debug!(
                pod = %virtual_pod.name_any(),
                "waiting for the virtual scheduler to assign a node"
            );
            return Ok(SyncResult::Done);
        }

        self.writer.sync_down_create(virtual_pod, &physical).await?;
        Ok(SyncResult::Done)
    }
}
