//! Host log directory rewriting
//!
//! Tenant pods that mount the node's log directories (log shippers, mostly)
//! must only see logs of their own tenant. Their hostPath volumes are pointed
//! at a per-tenant directory instead. A pod that mounts `/var/log/pods` also
//! gets the real directory mounted at a separate, physical-only path: the
//! per-tenant directory holds symlinks into the real one, and those links
//! only resolve if the real directory is mounted too. The physical-only path
//! lies outside the tenant-visible tree so scrapers never pick it up twice.
//!
//! Reconciles run this on every pass. The extra volume keeps the original
//! path, so its name suffix is what stops it from being rewritten again.

use k8s_openapi::api::core::v1::{Container, HostPathVolumeSource, Pod, Volume, VolumeMount};
use tracing::debug;

/// Node directory holding per-pod container logs
pub const POD_LOGGING_HOST_PATH: &str = "/var/log/pods";

/// Node log directory
pub const LOG_HOST_PATH: &str = "/var/log";

/// Suffix marking volumes that already point at the real pod log directory
pub const PHYSICAL_LOG_VOLUME_SUFFIX: &str = "twinsync-physical";

/// Where the real pod log directory is mounted in affected containers
pub const PHYSICAL_LOG_VOLUME_MOUNT_PATH: &str = "/var/twinsync/physical/log/pods";

/// Rewrite log hostPath volumes of a physical pod to the tenant's log root.
///
/// `virtual_logs_path` is the tenant's host log root. Returns true if the
/// pod was changed.
pub fn rewrite_host_paths(pod: &mut Pod, virtual_logs_path: &str) -> bool {
    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };
    let Some(volumes) = spec.volumes.as_mut() else {
        return false;
    };

    let mut physical_volumes = Vec::new();
    let mut changed = false;

    for volume in volumes.iter_mut() {
        let Some(host_path) = volume.host_path.as_mut() else {
            continue;
        };

        if host_path.path == POD_LOGGING_HOST_PATH && !is_physical_volume(&volume.name) {
            debug!(volume = %volume.name, "rewriting pod log hostPath");
            host_path.path = format!("{}/pods", virtual_logs_path);
            physical_volumes.push((volume.name.clone(), host_path.type_.clone()));
            changed = true;
        } else if host_path.path == LOG_HOST_PATH {
            debug!(volume = %volume.name, "rewriting log hostPath");
            host_path.path = virtual_logs_path.to_string();
            changed = true;
        }
    }

    for (name, host_path_type) in physical_volumes {
        add_physical_log_volume(volumes, &mut spec.containers, &name, host_path_type);
    }

    changed
}

fn is_physical_volume(name: &str) -> bool {
    name.ends_with(PHYSICAL_LOG_VOLUME_SUFFIX)
}

/// Name of the physical-only twin of a log volume
pub fn physical_volume_name(name: &str) -> String {
    format!("{}-{}", name, PHYSICAL_LOG_VOLUME_SUFFIX)
}

/// Add a volume for the real pod log directory and mount it next to every
/// existing mount of `volume_name`.
fn add_physical_log_volume(
    volumes: &mut Vec<Volume>,
    containers: &mut [Container],
    volume_name: &str,
    host_path_type: Option<String>,
) {
    let physical_name = physical_volume_name(volume_name);
    volumes.push(Volume {
        name: physical_name.clone(),
        host_path: Some(HostPathVolumeSource {
            path: POD_LOGGING_HOST_PATH.to_string(),
            type_: host_path_type,
        }),
        ..Default::default()
    });

    for container in containers.iter_mut() {
        let Some(mounts) = container.volume_mounts.as_mut() else {
            continue;
        };
        let extra: Vec<VolumeMount> = mounts
            .iter()
            .filter(|m| m.name == volume_name)
            .map(|m| VolumeMount {
                name: physical_name.clone(),
                mount_path: PHYSICAL_LOG_VOLUME_MOUNT_PATH.to_string(),
                ..m.clone()
            })
            .collect();
        if !extra.is_empty() {
            debug!(container = %container.name, volume = %physical_name, "mounting physical log path");
            mounts.extend(extra);
        }
    }
}
