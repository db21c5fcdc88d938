//! Node binding for virtual pods
//!
//! Nothing schedules pods in the virtual cluster. Once the host cluster has
//! placed the physical twin, the syncer binds the virtual pod to the same
//! node itself and waits briefly for the assignment to become visible.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};
use twinsync_common::retry::{poll_until, PollConfig};
use twinsync_common::Error;

use crate::client::DeleteOptions;
use crate::syncer::{node_name, PodSyncer};

/// Poll schedule for waiting on a bind to land
pub const BIND_POLL: PollConfig =
    PollConfig::new(Duration::from_millis(50), Duration::from_secs(2));

/// Outcome of [`PodSyncer::ensure_node`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeSync {
    /// Both twins agree on the node
    Converged,
    /// Something changed or is still pending; reconcile again
    Mutated,
}

impl PodSyncer {
    /// Bring the virtual pod's node assignment in line with the physical pod.
    ///
    /// Only meaningful once the physical pod has a node.
    pub async fn ensure_node(&self, physical: &Pod, virtual_pod: &Pod) -> Result<NodeSync, Error> {
        let physical_node = node_name(physical);
        let virtual_node = node_name(virtual_pod);

        if !virtual_node.is_empty() && virtual_node != physical_node {
            info!(
                pod = %virtual_pod.name_any(),
                namespace = %virtual_pod.namespace().unwrap_or_default(),
                virtual_node,
                physical_node,
                "virtual pod is bound to a different node, deleting it"
            );
            self.delete_virtual(virtual_pod, &DeleteOptions::default())
                .await?;
            return Ok(NodeSync::Mutated);
        }

        if self.virtual_client.get_node(physical_node).await?.is_none() {
            debug!(node = physical_node, "node not synced to the virtual cluster yet");
            return Ok(NodeSync::Mutated);
        }

        if virtual_node != physical_node {
            self.bind_to_node(virtual_pod, physical_node).await?;
            return Ok(NodeSync::Mutated);
        }

        Ok(NodeSync::Converged)
    }

    /// Bind the virtual pod and wait until the node name shows up or the pod
    /// is gone.
    async fn bind_to_node(&self, virtual_pod: &Pod, node: &str) -> Result<(), Error> {
        let namespace = virtual_pod.namespace().unwrap_or_default();
        let name = virtual_pod.name_any();
        info!(pod = %name, namespace = %namespace, node, "binding virtual pod");

        self.virtual_client.bind_pod(&namespace, &name, node).await?;

        let client = self.virtual_client.as_ref();
        let (namespace, name) = (namespace.as_str(), name.as_str());
        poll_until(&BIND_POLL, "bind virtual pod", || async move {
            Ok(match client.get_pod(namespace, name).await? {
                Some(pod) => !node_name(&pod).is_empty(),
                None => true,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{physical_pod, pod, with_node, TestSyncer};
    use k8s_openapi::api::core::v1::Node;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use twinsync_common::error::api_error;

    fn node(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node
    }

    #[tokio::test]
    async fn node_mismatch_deletes_virtual_pod() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_delete_pod()
            .with(eq("default"), eq("web"), eq(DeleteOptions::default()))
            .times(1)
            .returning(|_, _, _| Ok(()));
        test.vcluster.expect_get_node().never();
        test.vcluster.expect_bind_pod().never();
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let virtual_pod = with_node(pod("default", "web"), "n2");
        let result = syncer.ensure_node(&physical, &virtual_pod).await.unwrap();
        assert_eq!(result, NodeSync::Mutated);
    }

    #[tokio::test]
    async fn missing_virtual_node_waits_without_binding() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_get_node()
            .with(eq("n1"))
            .returning(|_| Ok(None));
        test.vcluster.expect_bind_pod().never();
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let result = syncer
            .ensure_node(&physical, &pod("default", "web"))
            .await
            .unwrap();
        assert_eq!(result, NodeSync::Mutated);
    }

    #[tokio::test]
    async fn binds_and_observes_node_name() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_get_node()
            .returning(|name| Ok(Some(node(name))));
        test.vcluster
            .expect_bind_pod()
            .with(eq("default"), eq("web"), eq("n1"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        // first poll still sees the unbound pod, the second sees "n1"
        let polls = Arc::new(AtomicUsize::new(0));
        let seen = polls.clone();
        test.vcluster.expect_get_pod().returning(move |ns, name| {
            let bound = seen.fetch_add(1, Ordering::SeqCst) > 0;
            let pod = pod(ns, name);
            Ok(Some(if bound { with_node(pod, "n1") } else { pod }))
        });
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let result = syncer
            .ensure_node(&physical, &pod("default", "web"))
            .await
            .unwrap();
        assert_eq!(result, NodeSync::Mutated);
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn vanished_pod_ends_the_poll() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_get_node()
            .returning(|name| Ok(Some(node(name))));
        test.vcluster.expect_bind_pod().returning(|_, _, _| Ok(()));
        test.vcluster
            .expect_get_pod()
            .times(1)
            .returning(|_, _| Ok(None));
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        assert_eq!(
            syncer
                .ensure_node(&physical, &pod("default", "web"))
                .await
                .unwrap(),
            NodeSync::Mutated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bind_that_never_lands_times_out() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_get_node()
            .returning(|name| Ok(Some(node(name))));
        test.vcluster.expect_bind_pod().returning(|_, _, _| Ok(()));
        test.vcluster
            .expect_get_pod()
            .returning(|ns, name| Ok(Some(pod(ns, name))));
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let err = syncer
            .ensure_node(&physical, &pod("default", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{}", err);
    }

    #[tokio::test]
    async fn poll_errors_fail_the_bind() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_get_node()
            .returning(|name| Ok(Some(node(name))));
        test.vcluster.expect_bind_pod().returning(|_, _, _| Ok(()));
        test.vcluster
            .expect_get_pod()
            .returning(|_, _| Err(api_error(500, "InternalError")));
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let err = syncer
            .ensure_node(&physical, &pod("default", "web"))
            .await
            .unwrap_err();
        assert_eq!(err.api_code(), Some(500));
    }

    #[tokio::test]
    async fn matching_nodes_are_converged() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_get_node()
            .returning(|name| Ok(Some(node(name))));
        test.vcluster.expect_bind_pod().never();
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let virtual_pod = with_node(pod("default", "web"), "n1");
        assert_eq!(
            syncer.ensure_node(&physical, &virtual_pod).await.unwrap(),
            NodeSync::Converged
        );
    }

    #[tokio::test]
    async fn missing_virtual_pod_on_delete_is_tolerated() {
        let mut test = TestSyncer::new();
        test.vcluster
            .expect_delete_pod()
            .returning(|_, _, _| Err(api_error(404, "NotFound")));
        let syncer = test.build();

        let physical = with_node(physical_pod("default", "web"), "n1");
        let virtual_pod = with_node(pod("default", "web"), "n2");
        assert_eq!(
            syncer.ensure_node(&physical, &virtual_pod).await.unwrap(),
            NodeSync::Mutated
        );
    }
}
