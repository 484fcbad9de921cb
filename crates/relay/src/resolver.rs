//! Works out which auxiliary objects each container of a pod needs.
//!
//! A node sends every config map, secret and projected volume map it
//! collected for a pod. [`resolve`] narrows those down to what each
//! container's volume mounts reference. It performs no I/O.
use std::fmt;
use std::path::Path;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container as KubeContainer, Pod as KubePod, Secret, Volume as KubeVolume,
};
use relay_api::RetrievedContainer;
use tracing::warn;

/// Volume kinds the resolver understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeKind {
    /// A config map volume.
    ConfigMap,
    /// A secret volume.
    Secret,
    /// A projected volume, shipped as a config map named after the volume.
    Projected,
    /// An emptyDir volume.
    EmptyDir,
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VolumeKind::ConfigMap => "configMap",
            VolumeKind::Secret => "secret",
            VolumeKind::Projected => "projected",
            VolumeKind::EmptyDir => "emptyDir",
        };
        f.write_str(name)
    }
}

/// A mount whose referenced object was not among the supplied ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingReference {
    /// The container with the mount.
    pub container: String,
    /// The volume being mounted.
    pub volume: String,
    /// The kind of the volume.
    pub kind: VolumeKind,
    /// The name of the object that was looked for.
    pub object: String,
}

/// The objects supplied with a create request.
#[derive(Clone, Copy, Debug)]
pub struct Available<'a> {
    /// Config maps supplied by the node.
    pub config_maps: &'a [ConfigMap],
    /// Secrets supplied by the node.
    pub secrets: &'a [Secret],
    /// Projected volume maps supplied by the node.
    pub projected_volume_maps: &'a [ConfigMap],
}

/// Per-container bundles for a pod.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    /// One bundle per container, main containers first, then init containers.
    pub containers: Vec<RetrievedContainer>,
    /// References that could not be satisfied. Each was logged as a warning.
    pub missing: Vec<MissingReference>,
    /// Mounted volumes of a kind the resolver does not handle, as
    /// `(container, volume)`. Each was logged as a warning.
    pub unsupported: Vec<(String, String)>,
}

/// Build the per-container bundles for `pod`.
///
/// `data_root` is only used to name the conventional emptyDir paths.
pub fn resolve(pod: &KubePod, available: Available<'_>, data_root: &Path) -> Resolution {
    let mut resolution = Resolution::default();
    let spec = match pod.spec.as_ref() {
        Some(spec) => spec,
        None => return resolution,
    };
    let volumes = spec.volumes.as_deref().unwrap_or_default();
    let init_containers = spec.init_containers.as_deref().unwrap_or_default();

    for container in spec.containers.iter().chain(init_containers) {
        let bundle = resolve_container(
            pod,
            container,
            volumes,
            available,
            data_root,
            &mut resolution,
        );
        resolution.containers.push(bundle);
    }
    resolution
}

fn resolve_container(
    pod: &KubePod,
    container: &KubeContainer,
    volumes: &[KubeVolume],
    available: Available<'_>,
    data_root: &Path,
    resolution: &mut Resolution,
) -> RetrievedContainer {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let mut bundle = RetrievedContainer {
        name: container.name.clone(),
        ..Default::default()
    };

    for mount in container.volume_mounts.as_deref().unwrap_or_default() {
        let volume = match volumes.iter().find(|v| v.name == mount.name) {
            Some(volume) => volume,
            None => {
                warn!(
                    pod = pod_name,
                    container = %container.name,
                    volume = %mount.name,
                    "Volume mount references an undeclared volume"
                );
                continue;
            }
        };

        let kind = match volume_kind(volume) {
            Some(kind) => kind,
            None => {
                warn!(
                    pod = pod_name,
                    container = %container.name,
                    volume = %volume.name,
                    "Unsupported volume kind, skipping"
                );
                resolution
                    .unsupported
                    .push((container.name.clone(), volume.name.clone()));
                continue;
            }
        };

        let object = match kind {
            VolumeKind::ConfigMap => volume
                .config_map
                .as_ref()
                .and_then(|c| c.name.clone())
                .unwrap_or_default(),
            VolumeKind::Secret => volume
                .secret
                .as_ref()
                .and_then(|s| s.secret_name.clone())
                .unwrap_or_default(),
            VolumeKind::Projected => volume.name.clone(),
            VolumeKind::EmptyDir => {
                bundle.empty_dirs.push(empty_dir_path(pod, &volume.name, data_root));
                continue;
            }
        };

        let found = match kind {
            VolumeKind::ConfigMap => {
                find_by_name(available.config_maps, &object, |c| &c.metadata.name)
                    .map(|c| bundle.config_maps.push(c.clone()))
            }
            VolumeKind::Secret => find_by_name(available.secrets, &object, |s| &s.metadata.name)
                .map(|s| bundle.secrets.push(s.clone())),
            VolumeKind::Projected => {
                find_by_name(available.projected_volume_maps, &object, |c| &c.metadata.name)
                    .map(|c| bundle.projected_volume_maps.push(c.clone()))
            }
            VolumeKind::EmptyDir => Some(()),
        };

        if found.is_none() {
            warn!(
                pod = pod_name,
                container = %container.name,
                volume = %volume.name,
                kind = %kind,
                object = %object,
                "Referenced object was not supplied with the create request"
            );
            resolution.missing.push(MissingReference {
                container: container.name.clone(),
                volume: volume.name.clone(),
                kind,
                object,
            });
        }
    }
    bundle
}

/// Check the supported members of a volume. The struct is not a map, so each
/// field is looked at in turn.
fn volume_kind(volume: &KubeVolume) -> Option<VolumeKind> {
    if volume.config_map.is_some() {
        Some(VolumeKind::ConfigMap)
    } else if volume.secret.is_some() {
        Some(VolumeKind::Secret)
    } else if volume.projected.is_some() {
        Some(VolumeKind::Projected)
    } else if volume.empty_dir.is_some() {
        Some(VolumeKind::EmptyDir)
    } else {
        None
    }
}

fn find_by_name<'a, T, F>(objects: &'a [T], name: &str, get_name: F) -> Option<&'a T>
where
    F: Fn(&T) -> &Option<String>,
{
    objects
        .iter()
        .find(|o| get_name(o).as_deref() == Some(name))
}

fn empty_dir_path(pod: &KubePod, volume: &str, data_root: &Path) -> String {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let uid = pod.metadata.uid.as_deref().unwrap_or_default();
    data_root
        .join(format!("{}-{}", namespace, uid))
        .join("emptyDirs")
        .join(volume)
        .to_string_lossy()
        .into_owned()
}
