//! Pod syncer context and reconcile entry points
//!
//! `PodSyncer` holds everything a reconcile needs: clients for both API
//! servers, the injected collaborators, and the validated options. The
//! policies themselves live next to it:
//! - `create`: first creation of the physical twin (`sync_down`)
//! - `steady`: two-way sync once both twins exist (`sync`)
//! - `node`: binding virtual pods to the node the host picked
//! - `ephemeral`: pushing new ephemeral containers down

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};
use twinsync_common::events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};
use twinsync_common::{Error, CONTROLLER_NAME};

use crate::client::{ClusterClient, DeleteOptions, KubeClusterClient};
use crate::collaborators::{
    ConditionMerger, IndexRegisterer, KubeSyncWriter, NoopIndexRegisterer,
    PermissiveSecurityValidator, PodSecurityValidator, PodTranslator, SyncWriter,
};
use crate::config::PodSyncerOptions;

/// Grace period used when a pod has none of its own
pub const DEFAULT_GRACE_PERIOD_SECONDS: i64 = 30;

/// Grace period for deleting pods that must go away immediately
pub const ZERO_GRACE_PERIOD_SECONDS: i64 = 0;

/// Delay before re-checking a pod whose node is missing from the virtual cluster
pub const MISSING_NODE_RETRY: Duration = Duration::from_secs(15);

/// Delay used for `SyncResult::Requeue` and write conflicts
const REQUEUE_SOON: Duration = Duration::from_secs(1);

const RETRY_DELAY: Duration = Duration::from_secs(15);

const PERMANENT_ERROR_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Outcome of a single reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncResult {
    /// Nothing left to do until the next change
    Done,
    /// The reconcile changed something; look again shortly
    Requeue,
    /// Look again after the given delay
    RequeueAfter(Duration),
}

impl SyncResult {
    /// Convert to a kube-runtime controller action
    pub fn into_action(self) -> Action {
        match self {
            SyncResult::Done => Action::await_change(),
            SyncResult::Requeue => Action::requeue(REQUEUE_SOON),
            SyncResult::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Shared state for pod reconciles
pub struct PodSyncer {
    /// Client for the tenant's virtual API
    pub virtual_client: Arc<dyn ClusterClient>,
    /// Client for the host cluster
    pub physical_client: Arc<dyn ClusterClient>,
    /// Pod spec translation
    pub translator: Arc<dyn PodTranslator>,
    /// Readiness-gate condition merging
    pub conditions: Arc<dyn ConditionMerger>,
    /// Pod security validation
    pub security: Arc<dyn PodSecurityValidator>,
    /// Final create/update writes
    pub writer: Arc<dyn SyncWriter>,
    /// Events on virtual pods
    pub events: Arc<dyn EventPublisher>,
    /// Index registration
    pub indices: Arc<dyn IndexRegisterer>,
    /// Validated options
    pub options: PodSyncerOptions,
}

impl PodSyncer {
    /// Start building a syncer with the given options
    pub fn builder(options: PodSyncerOptions) -> PodSyncerBuilder {
        PodSyncerBuilder::new(options)
    }

    /// Register the lookup indices the syncer relies on
    pub fn register_indices(&self) -> Result<(), Error> {
        self.indices.register_indices()
    }

    /// Reconcile a virtual pod against its physical twin, if there is one.
    ///
    /// API failures other than conflicts and not-found responses are also
    /// reported as a warning event on the virtual pod.
    pub async fn reconcile_virtual(&self, virtual_pod: &Pod) -> Result<SyncResult, Error> {
        let (namespace, name) = self.translator.physical_name(virtual_pod);
        match self.physical_client.get_pod(&namespace, &name).await {
            Ok(Some(physical)) => self.sync(&physical, virtual_pod).await,
            Ok(None) => self.sync_down(virtual_pod).await,
            Err(e) => self.report(virtual_pod, Err(e)).await,
        }
    }

    /// Publish a `SyncError` event on the virtual pod if the result is an
    /// error a user should see, then hand the result back.
    pub(crate) async fn report<T>(
        &self,
        virtual_pod: &Pod,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_user_visible() {
                self.publish_warning(
                    virtual_pod,
                    reasons::SYNC_ERROR,
                    format!("Error syncing pod: {}", e),
                )
                .await;
            }
        }
        result
    }

    /// Whether the configured pod security standard (if any) admits the pod
    pub(crate) async fn pod_security_allows(&self, virtual_pod: &Pod) -> Result<bool, Error> {
        let Some(standard) = self.options.pod_security_standard.as_deref() else {
            return Ok(true);
        };
        let valid = self.security.is_valid(virtual_pod, standard).await?;
        if !valid {
            info!(
                pod = %virtual_pod.name_any(),
                namespace = %virtual_pod.namespace().unwrap_or_default(),
                standard,
                "pod violates the pod security standard, not syncing"
            );
        }
        Ok(valid)
    }

    /// Delete a virtual pod, treating an already-gone pod as success
    pub(crate) async fn delete_virtual(
        &self,
        virtual_pod: &Pod,
        options: &DeleteOptions,
    ) -> Result<(), Error> {
        delete_tolerating_missing(self.virtual_client.as_ref(), virtual_pod, options).await
    }

    /// Delete a physical pod, treating an already-gone pod as success
    pub(crate) async fn delete_physical(
        &self,
        physical_pod: &Pod,
        options: &DeleteOptions,
    ) -> Result<(), Error> {
        delete_tolerating_missing(self.physical_client.as_ref(), physical_pod, options).await
    }

    pub(crate) async fn publish_warning(&self, pod: &Pod, reason: &str, note: String) {
        self.events
            .publish(
                &pod.object_ref(&()),
                EventType::Warning,
                reason,
                actions::SYNC,
                Some(note),
            )
            .await;
    }
}

async fn delete_tolerating_missing(
    client: &dyn ClusterClient,
    pod: &Pod,
    options: &DeleteOptions,
) -> Result<(), Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    match client.delete_pod(&namespace, &name, options).await {
        Err(e) if e.is_not_found() => {
            debug!(pod = %name, namespace = %namespace, "pod already gone");
            Ok(())
        }
        other => other,
    }
}

// =============================================================================
// Pod accessors
// =============================================================================

/// Whether deletion of the pod has been requested
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Assigned node, empty when unscheduled
pub fn node_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or_default()
}

/// Grace period the pod's pending deletion was requested with
pub fn deletion_grace_period(pod: &Pod) -> Option<i64> {
    pod.metadata.deletion_grace_period_seconds
}

/// Paths of the fields that differ between two objects, for change logs
pub(crate) fn changed_fields<T: serde::Serialize>(old: &T, new: &T) -> Vec<String> {
    fn walk(prefix: &str, old: &serde_json::Value, new: &serde_json::Value, out: &mut Vec<String>) {
        match (old, new) {
            (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
                let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
                keys.sort();
                keys.dedup();
                for key in keys {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    let null = serde_json::Value::Null;
                    walk(&path, a.get(key).unwrap_or(&null), b.get(key).unwrap_or(&null), out);
                }
            }
            (a, b) if a != b => out.push(prefix.to_string()),
            _ => {}
        }
    }

    let (Ok(old), Ok(new)) = (serde_json::to_value(old), serde_json::to_value(new)) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    walk("", &old, &new, &mut out);
    out
}

// =============================================================================
// kube-runtime entry points
// =============================================================================

/// Reconcile a virtual pod (kube-runtime `Controller::run` callback)
#[instrument(
    skip(pod, ctx),
    fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default())
)]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<PodSyncer>) -> Result<Action, Error> {
    debug!("reconciling pod");
    ctx.reconcile_virtual(&pod).await.map(SyncResult::into_action)
}

/// Error policy for the pod controller.
///
/// Conflicts mean another writer got there first and are retried quickly
/// and quietly. Errors that need someone to fix something are retried
/// rarely; everything else is retried after a short delay.
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<PodSyncer>) -> Action {
    if error.is_conflict() {
        debug!(pod = %pod.name_any(), "conflict while syncing pod, retrying");
        return Action::requeue(REQUEUE_SOON);
    }
    warn!(
        ?error,
        pod = %pod.name_any(),
        retryable = error.is_retryable(),
        "pod sync failed"
    );
    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::requeue(PERMANENT_ERROR_RETRY_DELAY)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`PodSyncer`]
pub struct PodSyncerBuilder {
    options: PodSyncerOptions,
    virtual_client: Option<Arc<dyn ClusterClient>>,
    physical_client: Option<Arc<dyn ClusterClient>>,
    translator: Option<Arc<dyn PodTranslator>>,
    conditions: Option<Arc<dyn ConditionMerger>>,
    security: Option<Arc<dyn PodSecurityValidator>>,
    writer: Option<Arc<dyn SyncWriter>>,
    events: Option<Arc<dyn EventPublisher>>,
    indices: Option<Arc<dyn IndexRegisterer>>,
}

impl PodSyncerBuilder {
    fn new(options: PodSyncerOptions) -> Self {
        Self {
            options,
            virtual_client: None,
            physical_client: None,
            translator: None,
            conditions: None,
            security: None,
            writer: None,
            events: None,
            indices: None,
        }
    }

    /// Use real API clients for both clusters; events go to the virtual API
    pub fn kube_clients(mut self, virtual_client: Client, physical_client: Client) -> Self {
        self.events = Some(Arc::new(KubeEventPublisher::new(
            virtual_client.clone(),
            CONTROLLER_NAME,
        )));
        self.virtual_client = Some(Arc::new(KubeClusterClient::new(virtual_client)));
        self.physical_client = Some(Arc::new(KubeClusterClient::new(physical_client)));
        self
    }

    /// Override the virtual cluster client
    pub fn virtual_client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.virtual_client = Some(client);
        self
    }

    /// Override the host cluster client
    pub fn physical_client(mut self, client: Arc<dyn ClusterClient>) -> Self {
        self.physical_client = Some(client);
        self
    }

    /// Set the pod translator
    pub fn translator(mut self, translator: Arc<dyn PodTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Set the condition merger
    pub fn conditions(mut self, conditions: Arc<dyn ConditionMerger>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Set the pod security validator
    pub fn security(mut self, security: Arc<dyn PodSecurityValidator>) -> Self {
        self.security = Some(security);
        self
    }

    /// Override the create/update writer
    pub fn writer(mut self, writer: Arc<dyn SyncWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the index registerer
    pub fn indices(mut self, indices: Arc<dyn IndexRegisterer>) -> Self {
        self.indices = Some(indices);
        self
    }

    /// Build the syncer
    ///
    /// Fails if a required collaborator is missing, or if a pod security
    /// standard is configured without a validator to enforce it.
    pub fn build(self) -> Result<PodSyncer, Error> {
        fn required<T: ?Sized>(value: Option<Arc<T>>, what: &str) -> Result<Arc<T>, Error> {
            value.ok_or_else(|| Error::validation(format!("pod syncer requires a {}", what)))
        }

        let security: Arc<dyn PodSecurityValidator> = match self.security {
            Some(security) => security,
            None if self.options.pod_security_standard.is_some() => {
                return Err(Error::validation_for_field(
                    "enforcePodSecurityStandard",
                    "a pod security standard is configured but no validator was provided",
                ))
            }
            None => Arc::new(PermissiveSecurityValidator),
        };

        let physical_client = required(self.physical_client, "physical cluster client")?;
        let writer = self
            .writer
            .unwrap_or_else(|| Arc::new(KubeSyncWriter::new(physical_client.clone())));

        Ok(PodSyncer {
            virtual_client: required(self.virtual_client, "virtual cluster client")?,
            physical_client,
            translator: required(self.translator, "pod translator")?,
            conditions: required(self.conditions, "condition merger")?,
            security,
            writer,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            indices: self.indices.unwrap_or_else(|| Arc::new(NoopIndexRegisterer)),
            options: self.options,
        })
    }
}
