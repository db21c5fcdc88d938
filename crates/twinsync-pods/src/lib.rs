//! Pod syncer for virtual clusters
//!
//! Keeps every pod a tenant creates in its virtual control plane in step
//! with a physical twin running on the shared host cluster. The virtual pod
//! owns the spec; the physical pod owns scheduling and status.
//!
//! Entry points:
//! - [`PodSyncer::sync_down`] creates the physical twin of a new virtual pod
//! - [`PodSyncer::sync`] reconciles an existing pair
//! - [`controller::build_pod_controller`] runs both from kube-runtime watches

#![deny(missing_docs)]

pub mod client;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod create;
pub mod ephemeral;
pub mod hostpath;
pub mod node;
pub mod steady;
pub mod syncer;

#[cfg(test)]
mod testing;

pub use client::{ClusterClient, DeleteOptions, KubeClusterClient};
pub use config::{PodSyncerConfig, PodSyncerOptions};
pub use node::NodeSync;
pub use syncer::{PodSyncer, PodSyncerBuilder, SyncResult};
