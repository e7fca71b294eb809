//! Pure edits on Deployments, Services and ConfigMaps
//!
//! Each function takes the freshly-read object and mutates it in place; the
//! controller wraps them in conflict-retried read-modify-write loops.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    HTTPGetAction, Probe, ResourceRequirements, Service, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::EnvoySettings;
use crate::{Error, Result};

/// Volume holding the proxy document (from the config object)
pub const CONFIG_VOLUME: &str = "envoy-config";
/// Writable scratch volume for capture files
pub const TAP_VOLUME: &str = "envoy-taps";
/// Mount path of the proxy document
pub const CONFIG_MOUNT_PATH: &str = "/etc/envoy";
/// Data key of the proxy document inside the config object
pub const CONFIG_DATA_KEY: &str = "envoy.yaml";
/// Pod-template annotation stamped to force a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Label marking config objects created by meshtap
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "meshtap";
/// Label carrying the owning session id
pub const SESSION_ID_LABEL: &str = "meshtap.io/session-id";
/// Annotation recording the service's pre-redirection target port
pub const ORIGINAL_PORT_ANNOTATION: &str = "meshtap.io/original-port";
/// Annotation recording the redirected service
pub const SERVICE_ANNOTATION: &str = "meshtap.io/service";
/// Annotation recording the injected deployment
pub const DEPLOYMENT_ANNOTATION: &str = "meshtap.io/deployment";

/// Selector matching every config object meshtap created
pub fn managed_config_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)
}

/// Ownership metadata written onto a session's config object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigOwner {
    /// Session id
    pub session_id: String,
    /// Service whose port was redirected
    pub service: String,
    /// Deployment that received the sidecar
    pub deployment: String,
    /// Port to restore on teardown
    pub original_port: i32,
}

impl ConfigOwner {
    /// Read ownership back from a config object created by [`build_config_map`]
    pub fn from_config_map(cm: &ConfigMap) -> Option<Self> {
        let labels = cm.metadata.labels.as_ref()?;
        let annotations = cm.metadata.annotations.as_ref()?;
        Some(Self {
            session_id: labels.get(SESSION_ID_LABEL)?.clone(),
            service: annotations.get(SERVICE_ANNOTATION)?.clone(),
            deployment: annotations.get(DEPLOYMENT_ANNOTATION)?.clone(),
            original_port: annotations.get(ORIGINAL_PORT_ANNOTATION)?.parse().ok()?,
        })
    }
}

/// Build the config object carrying a proxy document
pub fn build_config_map(
    namespace: &str,
    name: &str,
    document: &str,
    owner: &ConfigOwner,
) -> ConfigMap {
    let labels = BTreeMap::from([
        ("app".to_string(), "envoy-tap".to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (SESSION_ID_LABEL.to_string(), label_value(&owner.session_id)),
    ]);
    let annotations = BTreeMap::from([
        (
            ORIGINAL_PORT_ANNOTATION.to_string(),
            owner.original_port.to_string(),
        ),
        (SERVICE_ANNOTATION.to_string(), owner.service.clone()),
        (DEPLOYMENT_ANNOTATION.to_string(), owner.deployment.clone()),
    ]);

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_DATA_KEY.to_string(),
            document.to_string(),
        )])),
        ..Default::default()
    }
}

/// Label values are capped at 63 characters
fn label_value(value: &str) -> String {
    let mut v = value.to_string();
    v.truncate(crate::MAX_OBJECT_NAME_LEN);
    v
}

/// The sidecar container for the given settings
pub fn sidecar_container(settings: &EnvoySettings) -> Container {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };

    Container {
        name: settings.container_name.clone(),
        image: Some(settings.image.clone()),
        args: Some(vec![
            "-c".to_string(),
            format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_DATA_KEY),
            "--log-level".to_string(),
            settings.log_level.clone(),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("proxy".to_string()),
                container_port: i32::from(settings.listener_port),
                ..Default::default()
            },
            ContainerPort {
                name: Some("admin".to_string()),
                container_port: i32::from(settings.admin_port),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: TAP_VOLUME.to_string(),
                mount_path: settings.tap_dir.clone(),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(&settings.cpu_request, &settings.memory_request)),
            limits: Some(quantities(&settings.cpu_limit, &settings.memory_limit)),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(i32::from(settings.admin_port)),
                ..Default::default()
            }),
            period_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sidecar_volumes(config_ref: &str) -> [Volume; 2] {
    [
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_ref.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: TAP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

/// Replace the element named `name` in place, or append it
fn upsert_named<T>(items: &mut Vec<T>, item: T, name_of: impl Fn(&T) -> &str) {
    let name = name_of(&item).to_string();
    match items.iter().position(|existing| name_of(existing) == name) {
        Some(idx) => items[idx] = item,
        None => items.push(item),
    }
}

/// Ensure the pod template carries exactly one sidecar container and both
/// sidecar volumes, pointing at `config_ref`
///
/// Running it again replaces the sidecar and volumes in place, so repeated
/// injection never duplicates anything.
pub fn ensure_sidecar(
    deployment: &mut Deployment,
    settings: &EnvoySettings,
    config_ref: &str,
) -> Result<()> {
    let pod_spec = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .ok_or_else(|| Error::validation("deployment has no pod template spec"))?;

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    for volume in sidecar_volumes(config_ref) {
        upsert_named(volumes, volume, |v| v.name.as_str());
    }

    upsert_named(
        &mut pod_spec.containers,
        sidecar_container(settings),
        |c| c.name.as_str(),
    );

    deployment.metadata.managed_fields = None;
    Ok(())
}

/// Remove the sidecar container and both sidecar volumes
///
/// Returns false when there was nothing to remove.
pub fn strip_sidecar(deployment: &mut Deployment, container_name: &str) -> bool {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    else {
        return false;
    };

    let before = pod_spec.containers.len();
    pod_spec.containers.retain(|c| c.name != container_name);
    let mut changed = pod_spec.containers.len() != before;

    if let Some(volumes) = pod_spec.volumes.as_mut() {
        let before = volumes.len();
        volumes.retain(|v| v.name != CONFIG_VOLUME && v.name != TAP_VOLUME);
        changed |= volumes.len() != before;
    }

    deployment.metadata.managed_fields = None;
    changed
}

/// Whether the deployment currently carries the sidecar
pub fn has_sidecar(deployment: &Deployment, container_name: &str) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .is_some_and(|p| p.containers.iter().any(|c| c.name == container_name))
}

/// Stamp the restart annotation on the pod template
pub fn stamp_restart(deployment: &mut Deployment, timestamp: &str) -> Result<()> {
    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| Error::validation("deployment has no spec"))?;
    spec.template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(RESTARTED_AT_ANNOTATION.to_string(), timestamp.to_string());
    deployment.metadata.managed_fields = None;
    Ok(())
}

/// Target port of the service's first port
///
/// A missing target port defaults to the port itself, as Kubernetes does. A
/// named target port cannot be written back as a number and is rejected.
pub fn first_target_port(service: &Service) -> Result<i32> {
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|p| p.first())
        .ok_or_else(|| Error::validation("service has no ports"))?;

    match &port.target_port {
        Some(IntOrString::Int(p)) => Ok(*p),
        Some(IntOrString::String(name)) => match name.parse::<i32>() {
            Ok(p) => Ok(p),
            Err(_) => Err(Error::validation(format!(
                "service target port is the named port '{}'; numeric ports are required",
                name
            ))),
        },
        None => Ok(port.port),
    }
}

/// Point the service's first port at `target_port`
pub fn set_first_target_port(service: &mut Service, target_port: i32) -> Result<()> {
    let port = service
        .spec
        .as_mut()
        .and_then(|s| s.ports.as_mut())
        .and_then(|p| p.first_mut())
        .ok_or_else(|| Error::validation("service has no ports"))?;
    port.target_port = Some(IntOrString::Int(target_port));
    service.metadata.managed_fields = None;
    Ok(())
}

/// Rollout has begun: at least one replica runs the new template
pub fn rollout_started(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.updated_replicas)
        .unwrap_or(0)
        > 0
}

/// Rollout finished: the controller saw the latest generation and every
/// desired replica is updated and ready, with no old pods left over
pub fn rollout_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return desired == 0;
    };

    let observed = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    };

    observed
        && status.replicas.unwrap_or(0) == desired
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
}
