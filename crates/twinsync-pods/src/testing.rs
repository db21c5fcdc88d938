//! Test fixtures shared by the syncer policy tests

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use twinsync_common::events::RecordingEventPublisher;

use crate::client::MockClusterClient;
use crate::collaborators::{
    MockConditionMerger, MockPodSecurityValidator, MockPodTranslator, MockSyncWriter,
};
use crate::config::PodSyncerOptions;
use crate::syncer::PodSyncer;

pub(crate) const HOST_NAMESPACE: &str = "host-ns";

/// Mock collaborators, configured per test and then turned into a syncer
pub(crate) struct TestSyncer {
    pub vcluster: MockClusterClient,
    pub physical: MockClusterClient,
    pub translator: MockPodTranslator,
    pub conditions: MockConditionMerger,
    pub security: MockPodSecurityValidator,
    pub writer: MockSyncWriter,
    pub events: Arc<RecordingEventPublisher>,
    pub options: PodSyncerOptions,
}

impl TestSyncer {
    pub fn new() -> Self {
        Self {
            vcluster: MockClusterClient::new(),
            physical: MockClusterClient::new(),
            translator: MockPodTranslator::new(),
            conditions: MockConditionMerger::new(),
            security: MockPodSecurityValidator::new(),
            writer: MockSyncWriter::new(),
            events: Arc::new(RecordingEventPublisher::new()),
            options: PodSyncerOptions {
                target_namespace: HOST_NAMESPACE.to_string(),
                virtual_logs_path: "/tmp/twinsync/host-ns/tenant-a/log".to_string(),
                ..Default::default()
            },
        }
    }

    /// Map every virtual pod to `<name>-x-<namespace>` in the host namespace
    pub fn with_name_mapping(mut self) -> Self {
        self.translator.expect_physical_name().returning(|pod| {
            (
                HOST_NAMESPACE.to_string(),
                physical_name(
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                ),
            )
        });
        self
    }

    pub fn build(self) -> PodSyncer {
        let builder = PodSyncer::builder(self.options)
            .virtual_client(Arc::new(self.vcluster))
            .physical_client(Arc::new(self.physical))
            .translator(Arc::new(self.translator))
            .conditions(Arc::new(self.conditions))
            .writer(Arc::new(self.writer))
            .events(self.events)
            .security(Arc::new(self.security));
        match builder.build() {
            Ok(syncer) => syncer,
            Err(e) => panic!("test syncer: {}", e),
        }
    }
}

pub(crate) fn physical_name(namespace: &str, name: &str) -> String {
    format!("{}-x-{}", name, namespace)
}

/// A minimal unscheduled pod with one container
pub(crate) fn pod(namespace: &str, name: &str) -> Pod {
    let mut pod = Pod {
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx:1.27".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };
    pod.metadata.namespace = Some(namespace.to_string());
    pod.metadata.name = Some(name.to_string());
    pod.metadata.uid = Some(format!("uid-{}-{}", namespace, name));
    pod
}

/// The physical twin of `pod(namespace, name)`
pub(crate) fn physical_pod(namespace: &str, name: &str) -> Pod {
    let mut pod = pod(HOST_NAMESPACE, &physical_name(namespace, name));
    pod.metadata.uid = Some(format!("uid-physical-{}-{}", namespace, name));
    pod
}

pub(crate) fn with_node(mut pod: Pod, node: &str) -> Pod {
    if let Some(spec) = pod.spec.as_mut() {
        spec.node_name = Some(node.to_string());
    }
    pod
}

/// Mark the pod as deleted with the given grace period
pub(crate) fn terminating(mut pod: Pod, grace: Option<i64>) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    pod.metadata.deletion_grace_period_seconds = grace;
    pod
}

/// Record a start time, as if the pod had run before
pub(crate) fn started(mut pod: Pod) -> Pod {
    pod.status.get_or_insert_with(Default::default).start_time = Some(Time(Utc::now()));
    pod
}
