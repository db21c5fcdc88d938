//! API access for one side of the twin pair
//!
//! The syncer talks to two independent API servers: the tenant's virtual
//! control plane and the shared host cluster. Both are reached through the
//! same `ClusterClient` trait so the policies stay testable with mocks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Binding, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;
use tracing::debug;
use twinsync_common::Error;

#[cfg(test)]
use mockall::automock;

/// Options for a pod delete
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Grace period override; `None` uses the pod's own setting
    pub grace_period_seconds: Option<i64>,
    /// Only delete if the live object still has this UID
    pub uid_precondition: Option<String>,
}

impl DeleteOptions {
    /// Delete with the given grace period
    pub fn with_grace_period(seconds: i64) -> Self {
        Self {
            grace_period_seconds: Some(seconds),
            uid_precondition: None,
        }
    }

    /// Add a UID precondition
    pub fn with_uid(mut self, uid: Option<String>) -> Self {
        self.uid_precondition = uid;
        self
    }

    fn to_params(&self) -> DeleteParams {
        DeleteParams {
            // negative grace periods are rejected by the API server anyway
            grace_period_seconds: self
                .grace_period_seconds
                .map(|s| u32::try_from(s.max(0)).unwrap_or(u32::MAX)),
            preconditions: self.uid_precondition.as_ref().map(|uid| Preconditions {
                uid: Some(uid.clone()),
                resource_version: None,
            }),
            ..Default::default()
        }
    }
}

/// Trait abstracting the pod and node operations the syncer needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Replace a pod; fails with a conflict if its resourceVersion is stale
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Replace the status subresource of a pod
    async fn replace_pod_status(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), Error>;

    /// Assign a pod to a node through the binding subresource
    async fn bind_pod(&self, namespace: &str, name: &str, node_name: &str) -> Result<(), Error>;

    /// Replace the ephemeral containers of a pod through their subresource
    async fn replace_ephemeral_containers(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Get a node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Namespace and name of a pod, both required for any write
fn pod_key(pod: &Pod) -> Result<(&str, &str), Error> {
    match (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref()) {
        (Some(ns), Some(name)) => Ok((ns, name)),
        _ => Err(Error::internal_with_context(
            "cluster-client",
            "pod is missing namespace or name",
        )),
    }
}

fn to_body(pod: &Pod) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(pod).map_err(|e| Error::serialization_for_kind("Pod", e.to_string()))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let (ns, _) = pod_key(pod)?;
        Ok(self.pods(ns).create(&PostParams::default(), pod).await?)
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let (ns, name) = pod_key(pod)?;
        Ok(self.pods(ns).replace(name, &PostParams::default(), pod).await?)
    }

    async fn replace_pod_status(&self, pod: &Pod) -> Result<Pod, Error> {
        let (ns, name) = pod_key(pod)?;
        Ok(self
            .pods(ns)
            .replace_subresource("status", name, &PostParams::default(), to_body(pod)?)
            .await?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), Error> {
        debug!(pod = %name, namespace = %namespace, ?options, "deleting pod");
        self.pods(namespace)
            .delete(name, &options.to_params())
            .await?;
        Ok(())
    }

    async fn bind_pod(&self, namespace: &str, name: &str, node_name: &str) -> Result<(), Error> {
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node_name.to_string()),
                ..Default::default()
            },
        };
        let body = serde_json::to_vec(&binding)
            .map_err(|e| Error::serialization_for_kind("Binding", e.to_string()))?;

        let _: serde_json::Value = self
            .pods(namespace)
            .create_subresource("binding", name, &PostParams::default(), body)
            .await?;
        Ok(())
    }

    async fn replace_ephemeral_containers(&self, pod: &Pod) -> Result<Pod, Error> {
        let (ns, name) = pod_key(pod)?;
        Ok(self
            .pods(ns)
            .replace_subresource(
                "ephemeralcontainers",
                name,
                &PostParams::default(),
                to_body(pod)?,
            )
            .await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get_opt(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_options_map_to_params() {
        let params = DeleteOptions::with_grace_period(10)
            .with_uid(Some("uid-1".to_string()))
            .to_params();
        assert_eq!(params.grace_period_seconds, Some(10));
        assert_eq!(
            params.preconditions.and_then(|p| p.uid).as_deref(),
            Some("uid-1")
        );
    }

    #[test]
    fn default_delete_options_leave_server_defaults() {
        let params = DeleteOptions::default().to_params();
        assert_eq!(params.grace_period_seconds, None);
        assert!(params.preconditions.is_none());
    }

    #[test]
    fn negative_grace_period_is_clamped() {
        let params = DeleteOptions::with_grace_period(-5).to_params();
        assert_eq!(params.grace_period_seconds, Some(0));
    }

    #[test]
    fn pod_key_requires_namespace_and_name() {
        let mut pod = Pod::default();
        assert!(pod_key(&pod).is_err());
        pod.metadata.name = Some("web".to_string());
        pod.metadata.namespace = Some("default".to_string());
        assert_eq!(pod_key(&pod).unwrap(), ("default", "web"));
    }
}
