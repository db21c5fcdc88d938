//! Two-way sync between existing twins
//!
//! Each call resolves at most one concern and then returns; the next event
//! on either twin picks up where it left off. In priority order:
//! 1. deletion of the physical pod flows up
//! 2. deletion of the virtual pod flows down
//! 3. node assignment flows up
//! 4. conditions, then status, flow up
//! 5. ephemeral containers flow down
//! 6. spec changes flow down

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::ResourceExt;
use tracing::{debug, info};
use twinsync_common::Error;

use crate::client::DeleteOptions;
use crate::node::NodeSync;
use crate::syncer::{
    changed_fields, deletion_grace_period, is_terminating, node_name, PodSyncer, SyncResult,
    DEFAULT_GRACE_PERIOD_SECONDS,
};

/// Set to "true" on physical pods that carry the hosts rewrite init container
pub const HOSTS_REWRITTEN_ANNOTATION: &str = "twinsync.dev/hosts-rewritten";

/// Name of the init container that patches /etc/hosts in physical pods
pub const HOSTS_REWRITE_CONTAINER_NAME: &str = "twinsync-rewrite-hosts";

/// Drop the hosts rewrite init container's status from a physical pod.
///
/// Tenants never declared that container, so its status must not reach the
/// virtual pod. Pods without the rewrite annotation are returned unchanged.
pub fn strip_host_rewrite_container(physical: &Pod) -> Pod {
    let mut pod = physical.clone();
    let rewritten = physical
        .annotations()
        .get(HOSTS_REWRITTEN_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false);
    if rewritten {
        if let Some(status) = pod.status.as_mut() {
            remove_rewrite_status(status);
        }
    }
    pod
}

fn remove_rewrite_status(status: &mut PodStatus) {
    if let Some(statuses) = status.init_container_statuses.as_mut() {
        statuses.retain(|s| s.name != HOSTS_REWRITE_CONTAINER_NAME);
        if statuses.is_empty() {
            status.init_container_statuses = None;
        }
    }
}

/// Status as compared between twins: without the rewrite container entry
fn comparable_status(pod: &Pod) -> Option<PodStatus> {
    let mut status = pod.status.clone()?;
    remove_rewrite_status(&mut status);
    Some(status)
}

impl PodSyncer {
    /// Reconcile a virtual pod with its existing physical twin.
    ///
    /// Errors a user should see are also published as a `SyncError` event.
    pub async fn sync(&self, physical: &Pod, virtual_pod: &Pod) -> Result<SyncResult, Error> {
        let result = self.reconcile_pair(physical, virtual_pod).await;
        self.report(virtual_pod, result).await
    }

    async fn reconcile_pair(&self, physical: &Pod, virtual_pod: &Pod) -> Result<SyncResult, Error> {
        if is_terminating(physical) {
            self.propagate_physical_deletion(physical, virtual_pod).await?;
            return Ok(SyncResult::Done);
        }

        if is_terminating(virtual_pod) {
            let options = DeleteOptions {
                grace_period_seconds: deletion_grace_period(virtual_pod),
                uid_precondition: physical.uid(),
            };
            info!(
                pod = %virtual_pod.name_any(),
                namespace = %virtual_pod.namespace().unwrap_or_default(),
                grace_period = ?options.grace_period_seconds,
                "virtual pod is being deleted, deleting physical pod"
            );
            self.delete_physical(physical, &options).await?;
            return Ok(SyncResult::Done);
        }

        // A virtual pod bound elsewhere is deleted by ensure_node, so there
        // is no separate node mismatch check further down.
        if !node_name(physical).is_empty()
            && self.ensure_node(physical, virtual_pod).await? == NodeSync::Mutated
        {
            return Ok(SyncResult::Requeue);
        }

        let stripped = strip_host_rewrite_container(physical);
        if self.conditions.update_conditions(&stripped, virtual_pod).await? {
            return Ok(SyncResult::Done);
        }
        if self.sync_status(&stripped, virtual_pod).await? {
            return Ok(SyncResult::Done);
        }

        self.sync_ephemeral_containers(physical, virtual_pod).await?;

        if !self.pod_security_allows(virtual_pod).await? {
            return Ok(SyncResult::Done);
        }

        if let Some(updated) = self.translator.translate_update(physical, virtual_pod).await? {
            debug!(
                pod = %virtual_pod.name_any(),
                changed = ?changed_fields(physical, &updated),
                "spec changes to sync"
            );
            self.writer.sync_down_update(virtual_pod, &updated).await?;
        }
        Ok(SyncResult::Done)
    }

    async fn propagate_physical_deletion(
        &self,
        physical: &Pod,
        virtual_pod: &Pod,
    ) -> Result<(), Error> {
        if !is_terminating(virtual_pod) {
            let grace = virtual_pod
                .spec
                .as_ref()
                .and_then(|s| s.termination_grace_period_seconds)
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS);
            info!(
                pod = %virtual_pod.name_any(),
                namespace = %virtual_pod.namespace().unwrap_or_default(),
                grace_period = grace,
                "physical pod is being deleted, deleting virtual pod"
            );
            return self
                .delete_virtual(virtual_pod, &DeleteOptions::with_grace_period(grace))
                .await;
        }

        let physical_grace = deletion_grace_period(physical);
        if deletion_grace_period(virtual_pod) != physical_grace {
            info!(
                pod = %virtual_pod.name_any(),
                namespace = %virtual_pod.namespace().unwrap_or_default(),
                grace_period = ?physical_grace,
                "aligning virtual pod deletion with physical grace period"
            );
            let options = DeleteOptions {
                grace_period_seconds: physical_grace,
                uid_precondition: virtual_pod.uid(),
            };
            return self.delete_virtual(virtual_pod, &options).await;
        }
        Ok(())
    }

    /// Copy the physical status onto the virtual pod if they differ.
    ///
    /// Returns true if a write was made.
    async fn sync_status(&self, stripped: &Pod, virtual_pod: &Pod) -> Result<bool, Error> {
        if comparable_status(stripped) == comparable_status(virtual_pod) {
            return Ok(false);
        }

        let mut updated = virtual_pod.clone();
        updated.status = stripped.status.clone();
        debug!(
            pod = %virtual_pod.name_any(),
            changed = ?changed_fields(virtual_pod, &updated),
            "updating virtual pod status"
        );
        self.virtual_client.replace_pod_status(&updated).await?;
        Ok(true)
    }
}
