//! Socket volumes shared with the injected sidecars.

use k8s_openapi::api::core::v1::{CSIVolumeSource, HostPathVolumeSource, Volume, VolumeMount};

use crate::webhooks::security::SecurityLevel;

pub const SPIRE_AGENT_SOCKET_VOLUME: &str = "spire-agent-socket";
pub const SPIRE_AGENT_SOCKET_PATH: &str = "/run/spire/sockets";
pub const SPIFFE_CSI_DRIVER: &str = "csi.spiffe.io";

pub const NSM_SOCKET_VOLUME: &str = "nsm-socket";
pub const NSM_SOCKET_PATH: &str = "/var/lib/networkservicemesh";
pub const NSM_CSI_DRIVER: &str = "csi.networkservicemesh.io";

const SOCKETS: [(&str, &str, &str); 2] = [
    (SPIRE_AGENT_SOCKET_VOLUME, SPIRE_AGENT_SOCKET_PATH, SPIFFE_CSI_DRIVER),
    (NSM_SOCKET_VOLUME, NSM_SOCKET_PATH, NSM_CSI_DRIVER),
];

/// Read-only mounts of both sockets.
pub fn volume_mounts() -> Vec<VolumeMount> {
    SOCKETS
        .iter()
        .map(|(name, path, _)| VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            read_only: Some(true),
            ..Default::default()
        })
        .collect()
}

/// Volumes backing the sockets.
///
/// Only privileged namespaces may use host paths; everything else goes
/// through the CSI drivers.
pub fn sidecar_volumes(level: SecurityLevel) -> Vec<Volume> {
    SOCKETS
        .iter()
        .map(|(name, path, driver)| {
            let mut volume = Volume {
                name: name.to_string(),
                ..Default::default()
            };
            if level == SecurityLevel::Privileged {
                volume.host_path = Some(HostPathVolumeSource {
                    path: path.to_string(),
                    type_: Some("Directory".to_string()),
                });
            } else {
                volume.csi = Some(CSIVolumeSource {
                    driver: driver.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
            volume
        })
        .collect()
}
