//! Pod controller wiring
//!
//! Virtual pods drive the controller. Two extra watches feed it:
//! - physical pods in the tenant's host namespace, mapped back to their
//!   virtual pod by the translator
//! - virtual namespaces, so a label change re-syncs every pod in them
//!   (translated pods carry their namespace's labels)

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};
use twinsync_common::Error;

use crate::collaborators::PodTranslator;
use crate::syncer::{error_policy, reconcile, PodSyncer};

/// Server-side watch timeout, kept below the client's read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Last seen labels of every virtual namespace
#[derive(Default)]
pub struct NamespaceLabelTracker {
    seen: DashMap<String, BTreeMap<String, String>>,
}

impl NamespaceLabelTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the namespace's labels, returning true if they changed since
    /// the last sighting. The first sighting is never a change.
    ///
    /// A namespace being deleted is dropped from the tracker, so a namespace
    /// re-created under the same name starts over.
    pub fn observe(&self, namespace: &Namespace) -> bool {
        if namespace.metadata.deletion_timestamp.is_some() {
            self.seen.remove(&namespace.name_any());
            return false;
        }
        let labels = namespace.labels().clone();
        match self.seen.insert(namespace.name_any(), labels.clone()) {
            Some(previous) => previous != labels,
            None => false,
        }
    }
}

/// Keys of every pod in the namespace
pub fn pods_in_namespace<I>(pods: I, namespace: &str) -> Vec<ObjectRef<Pod>>
where
    I: IntoIterator<Item = Arc<Pod>>,
{
    pods.into_iter()
        .filter(|pod| pod.namespace().as_deref() == Some(namespace))
        .map(|pod| ObjectRef::from_obj(pod.as_ref()))
        .collect()
}

/// Map a namespace event to the pods to reconcile.
///
/// Pods come from the controller's own cache, so this never calls the API.
pub fn namespace_mapper(
    tracker: Arc<NamespaceLabelTracker>,
    pods: Store<Pod>,
) -> impl Fn(Namespace) -> Vec<ObjectRef<Pod>> + Send + Sync + 'static {
    move |namespace| {
        if !tracker.observe(&namespace) {
            return Vec::new();
        }
        let keys = pods_in_namespace(pods.state(), &namespace.name_any());
        debug!(
            namespace = %namespace.name_any(),
            pods = keys.len(),
            "namespace labels changed, requeueing pods"
        );
        keys
    }
}

/// Map a physical pod to its virtual pod, if it belongs to this tenant
pub fn physical_pod_mapper(
    translator: Arc<dyn PodTranslator>,
) -> impl Fn(Pod) -> Option<ObjectRef<Pod>> + Send + Sync + 'static {
    move |physical| {
        translator
            .virtual_name(&physical)
            .map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
    }
}

/// Build the pod controller future.
///
/// Registers indices first so a failure there stops startup instead of
/// surfacing on every reconcile.
pub fn build_pod_controller(
    virtual_client: Client,
    physical_client: Client,
    syncer: Arc<PodSyncer>,
) -> Result<impl Future<Output = ()>, Error> {
    syncer.register_indices()?;

    let watcher_config = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let virtual_pods: Api<Pod> = Api::all(virtual_client.clone());
    let namespaces: Api<Namespace> = Api::all(virtual_client);
    let physical_pods: Api<Pod> =
        Api::namespaced(physical_client, &syncer.options.target_namespace);

    info!(
        target_namespace = %syncer.options.target_namespace,
        "starting pod controller"
    );

    let controller = Controller::new(virtual_pods, watcher_config());
    let store = controller.store();
    let tracker = Arc::new(NamespaceLabelTracker::new());

    Ok(controller
        .watches(
            physical_pods,
            watcher_config(),
            physical_pod_mapper(syncer.translator.clone()),
        )
        .watches(namespaces, watcher_config(), namespace_mapper(tracker, store))
        .shutdown_on_signal()
        .run(reconcile, error_policy, syncer)
        .for_each(|result| async move { log_reconcile_result(result) }))
}

type ReconcileResult = Result<
    (ObjectRef<Pod>, Action),
    kube::runtime::controller::Error<Error, watcher::Error>,
>;

fn log_reconcile_result(result: ReconcileResult) {
    match result {
        Ok((obj, action)) => debug!(pod = %obj.name, ?action, "reconcile completed"),
        Err(e) => warn!(error = %e, "pod reconcile failed"),
    }
}
