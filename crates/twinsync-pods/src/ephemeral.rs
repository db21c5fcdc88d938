//! Ephemeral container propagation
//!
//! Debug containers are added to a running virtual pod through its
//! `ephemeralcontainers` subresource and have to reach the physical pod the
//! same way. Their env is translated like any other container's.

use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use kube::ResourceExt;
use tracing::info;
use twinsync_common::Error;

use crate::syncer::PodSyncer;

fn ephemeral_containers(pod: &Pod) -> &[EphemeralContainer] {
    pod.spec
        .as_ref()
        .and_then(|s| s.ephemeral_containers.as_deref())
        .unwrap_or_default()
}

/// True if the virtual pod declares ephemeral containers the physical pod
/// does not have yet.
///
/// Compares count, then name and image index by index.
pub fn ephemeral_containers_changed(virtual_pod: &Pod, physical_pod: &Pod) -> bool {
    let wanted = ephemeral_containers(virtual_pod);
    if wanted.is_empty() {
        return false;
    }
    let existing = ephemeral_containers(physical_pod);
    if wanted.len() != existing.len() {
        return true;
    }
    wanted
        .iter()
        .zip(existing)
        .any(|(w, e)| w.name != e.name || w.image != e.image)
}

impl PodSyncer {
    /// Push the virtual pod's ephemeral containers to the physical pod.
    ///
    /// Returns true if an update was sent.
    pub async fn sync_ephemeral_containers(
        &self,
        physical: &Pod,
        virtual_pod: &Pod,
    ) -> Result<bool, Error> {
        if !ephemeral_containers_changed(virtual_pod, physical) {
            return Ok(false);
        }

        let service_env = self.translator.service_environment(virtual_pod).await?;
        let containers: Vec<EphemeralContainer> = ephemeral_containers(virtual_pod)
            .iter()
            .cloned()
            .map(|mut container| {
                let (env, env_from) = self.translator.translate_container_env(
                    container.env.take(),
                    container.env_from.take(),
                    virtual_pod,
                    &service_env,
                );
                container.env = env;
                container.env_from = env_from;
                container
            })
            .collect();

        info!(
            pod = %virtual_pod.name_any(),
            namespace = %virtual_pod.namespace().unwrap_or_default(),
            count = containers.len(),
            "syncing ephemeral containers"
        );

        let mut updated = physical.clone();
        updated.spec.get_or_insert_with(Default::default).ephemeral_containers = Some(containers);
        self.physical_client
            .replace_ephemeral_containers(&updated)
            .await?;
        Ok(true)
    }
}
