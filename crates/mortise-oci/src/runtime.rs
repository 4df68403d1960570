//! OCI Runtime Specification types relevant to mount setup.
//!
//! Based on the OCI Runtime Specification v1.2.0:
//! <https://github.com/opencontainers/runtime-spec/blob/main/config.md>
//!
//! Only the fields the mount engine consumes are modelled; unknown fields in
//! a `config.json` are ignored on deserialization.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// OCI Runtime Specification (config.json), mount subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI version.
    #[serde(default = "default_oci_version")]
    pub oci_version: String,

    /// Container's root filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    /// Additional mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

fn default_oci_version() -> String {
    "1.2.0".to_string()
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            oci_version: default_oci_version(),
            root: None,
            mounts: Vec::new(),
            linux: None,
        }
    }
}

impl Spec {
    /// Load a spec from a `config.json` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<std::path::Path>) -> mortise_common::MortiseResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem.
    pub path: PathBuf,

    /// Whether the root filesystem is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Mount destination path (inside container).
    pub destination: String,
    /// Mount type (e.g., "bind", "tmpfs", "proc").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Mount source (host path for binds, free-form for virtual filesystems).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Per-mount UID mappings for id-mapped mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    /// Per-mount GID mappings for id-mapped mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// UID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    /// Namespaces to create/join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    /// Rootfs propagation mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_propagation: Option<String>,
    /// Masked paths (hidden from container).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    /// Read-only paths.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
}

/// ID mapping for user/group namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    /// Container ID (start of range).
    #[serde(rename = "containerID")]
    pub container_id: u32,
    /// Host ID (start of range).
    #[serde(rename = "hostID")]
    pub host_id: u32,
    /// Size of the range.
    pub size: u32,
}

/// Namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to existing namespace (to join instead of create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
    /// Time namespace.
    Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_default() {
        let spec = Spec::default();
        assert_eq!(spec.oci_version, "1.2.0");
        assert!(spec.root.is_none());
        assert!(spec.mounts.is_empty());
    }

    #[test]
    fn mount_with_idmap_fields() {
        let json = r#"{
            "destination": "/foo",
            "type": "bind",
            "source": "/srv/data",
            "options": ["bind", "ro", "idmap"],
            "uidMappings": [{"containerID": 0, "hostID": 1, "size": 10}],
            "gidMappings": [{"containerID": 0, "hostID": 1, "size": 10}]
        }"#;
        let mount: Mount = serde_json::from_str(json).unwrap();
        assert_eq!(mount.destination, "/foo");
        assert_eq!(mount.mount_type.as_deref(), Some("bind"));
        assert_eq!(
            mount.uid_mappings,
            vec![IdMapping {
                container_id: 0,
                host_id: 1,
                size: 10
            }]
        );
    }

    #[test]
    fn linux_overlay_paths() {
        let json = r#"{
            "ociVersion": "1.0.0",
            "mounts": [{"destination": "/proc", "type": "proc"}],
            "linux": {
                "readonlyPaths": ["/proc/bus"],
                "maskedPaths": ["/proc/kcore"],
                "rootfsPropagation": "rslave",
                "namespaces": [{"type": "mount"}, {"type": "network"}]
            }
        }"#;
        let spec: Spec = serde_json::from_str(json).unwrap();
        let linux = spec.linux.unwrap();
        assert_eq!(linux.readonly_paths, vec!["/proc/bus"]);
        assert_eq!(linux.masked_paths, vec!["/proc/kcore"]);
        assert_eq!(linux.rootfs_propagation.as_deref(), Some("rslave"));
        assert_eq!(linux.namespaces[1].ns_type, NamespaceType::Network);
        assert!(spec.mounts[0].source.is_none());
    }

    #[test]
    fn namespace_type_serialization() {
        let ns = Namespace {
            ns_type: NamespaceType::Cgroup,
            path: None,
        };
        let json = serde_json::to_string(&ns).unwrap();
        assert!(json.contains("\"type\":\"cgroup\""));
    }
}
