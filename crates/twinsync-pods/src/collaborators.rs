//! Capabilities the syncer depends on but does not implement
//!
//! Translating pod specs between the two clusters, merging readiness-gate
//! conditions and validating pod security are owned by other components.
//! They are injected as trait objects so the reconcile policies can be
//! exercised against mocks.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvFromSource, EnvVar, Pod};
use kube::ResourceExt;
use tracing::info;
use twinsync_common::Error;

use crate::client::ClusterClient;

#[cfg(test)]
use mockall::automock;

/// Env and envFrom of a container after translation
pub type TranslatedEnv = (Option<Vec<EnvVar>>, Option<Vec<EnvFromSource>>);

/// Pod spec translation between the virtual and the physical cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodTranslator: Send + Sync {
    /// Build the baseline physical pod for a virtual pod
    async fn translate(&self, virtual_pod: &Pod) -> Result<Pod, Error>;

    /// Compute the write that brings the twins' specs back in line, if any
    async fn translate_update(
        &self,
        physical_pod: &Pod,
        virtual_pod: &Pod,
    ) -> Result<Option<Pod>, Error>;

    /// Service-link environment the tenant's containers would see
    async fn service_environment(&self, virtual_pod: &Pod) -> Result<Vec<EnvVar>, Error>;

    /// Translate one container's env and envFrom for the host cluster
    fn translate_container_env(
        &self,
        env: Option<Vec<EnvVar>>,
        env_from: Option<Vec<EnvFromSource>>,
        virtual_pod: &Pod,
        service_env: &[EnvVar],
    ) -> TranslatedEnv;

    /// Host (namespace, name) of a virtual pod
    fn physical_name(&self, virtual_pod: &Pod) -> (String, String);

    /// Virtual (namespace, name) a host pod belongs to, `None` if it is not ours
    fn virtual_name(&self, physical_pod: &Pod) -> Option<(String, String)>;
}

/// Readiness-gate condition merger
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConditionMerger: Send + Sync {
    /// Merge conditions between the twins, returning true if anything was written
    async fn update_conditions(&self, physical_pod: &Pod, virtual_pod: &Pod)
        -> Result<bool, Error>;
}

/// Pod security standard validation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodSecurityValidator: Send + Sync {
    /// True if the pod satisfies the given standard
    async fn is_valid(&self, virtual_pod: &Pod, standard: &str) -> Result<bool, Error>;
}

/// Final writes once the desired object is known
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncWriter: Send + Sync {
    /// Create the physical twin of a virtual pod
    async fn sync_down_create(&self, virtual_pod: &Pod, physical_pod: &Pod) -> Result<(), Error>;

    /// Submit the update computed by `PodTranslator::translate_update`
    async fn sync_down_update(&self, virtual_pod: &Pod, updated: &Pod) -> Result<(), Error>;
}

/// Registration of lookup indices with the event-routing framework
#[cfg_attr(test, automock)]
pub trait IndexRegisterer: Send + Sync {
    /// Register the indices this syncer relies on
    fn register_indices(&self) -> Result<(), Error>;
}

/// Writes to the host cluster
pub struct KubeSyncWriter {
    physical: Arc<dyn ClusterClient>,
}

impl KubeSyncWriter {
    /// Create a writer targeting the given host cluster client
    pub fn new(physical: Arc<dyn ClusterClient>) -> Self {
        Self { physical }
    }
}

#[async_trait]
impl SyncWriter for KubeSyncWriter {
    async fn sync_down_create(&self, virtual_pod: &Pod, physical_pod: &Pod) -> Result<(), Error> {
        info!(
            pod = %virtual_pod.name_any(),
            namespace = %virtual_pod.namespace().unwrap_or_default(),
            physical = %physical_pod.name_any(),
            "creating physical pod"
        );
        self.physical.create_pod(physical_pod).await?;
        Ok(())
    }

    async fn sync_down_update(&self, virtual_pod: &Pod, updated: &Pod) -> Result<(), Error> {
        info!(
            pod = %virtual_pod.name_any(),
            namespace = %virtual_pod.namespace().unwrap_or_default(),
            "updating physical pod"
        );
        self.physical.replace_pod(updated).await?;
        Ok(())
    }
}

/// Accepts every pod; used when no security standard is enforced
pub struct PermissiveSecurityValidator;

#[async_trait]
impl PodSecurityValidator for PermissiveSecurityValidator {
    async fn is_valid(&self, _virtual_pod: &Pod, _standard: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Registers nothing
pub struct NoopIndexRegisterer;

impl IndexRegisterer for NoopIndexRegisterer {
    fn register_indices(&self) -> Result<(), Error> {
        Ok(())
    }
}
