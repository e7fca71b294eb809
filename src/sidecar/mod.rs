//! Sidecar lifecycle against the cluster
//!
//! [`SidecarController`] owns every cluster mutation a session makes: the
//! config object, sidecar injection and removal, the service port rewrite and
//! the rollout waits. Writes are read-modify-write loops retried on version
//! conflicts; each attempt re-reads the object.

pub mod workload;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::{EnvoySettings, SessionSettings};
use crate::kube_utils::poll_until;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::{Error, Result};

pub use workload::{
    build_config_map, ensure_sidecar, first_target_port, has_sidecar, managed_config_selector,
    strip_sidecar, ConfigOwner, CONFIG_DATA_KEY, MANAGED_BY_LABEL, ORIGINAL_PORT_ANNOTATION,
    RESTARTED_AT_ANNOTATION, SESSION_ID_LABEL,
};

/// Rollout health of a target deployment as shown in status views
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentHealth {
    /// Every replica ready
    Ready,
    /// Some replicas not ready
    NotReady,
    /// Deployment does not exist
    NotFound,
    /// No status reported yet
    Unknown,
    /// Status could not be read
    Error,
}

/// Presence of a target service as shown in status views
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceHealth {
    /// Service exists
    Active,
    /// Service does not exist
    NotFound,
    /// Service could not be read
    Error,
}

/// Drives sidecar-related cluster changes for sessions
pub struct SidecarController {
    cluster: Arc<dyn ClusterClient>,
    envoy: EnvoySettings,
    conflict_retry: RetryConfig,
    rollout_timeout: Duration,
    rollout_start_timeout: Duration,
    poll_interval: Duration,
}

impl SidecarController {
    /// Create a controller over the given cluster client
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        envoy: EnvoySettings,
        session: &SessionSettings,
    ) -> Self {
        Self {
            cluster,
            envoy,
            conflict_retry: session.conflict_retry(),
            rollout_timeout: session.rollout_timeout(),
            rollout_start_timeout: session.rollout_start_timeout(),
            poll_interval: session.poll_interval(),
        }
    }

    /// Port the sidecar listens on
    pub fn proxy_port(&self) -> i32 {
        i32::from(self.envoy.listener_port)
    }

    /// Sidecar container name
    pub fn container_name(&self) -> &str {
        &self.envoy.container_name
    }

    /// Create or replace the session's config object
    pub async fn apply_config(
        &self,
        namespace: &str,
        name: &str,
        document: &str,
        owner: &ConfigOwner,
    ) -> Result<()> {
        let resource = format!("configmap/{}/{}", namespace, name);
        retry_on_conflict(&self.conflict_retry, &resource, || async {
            let mut desired = build_config_map(namespace, name, document, owner);
            match self.cluster.get_config_map(namespace, name).await? {
                Some(existing) => {
                    desired.metadata.resource_version = existing.metadata.resource_version;
                    self.cluster.replace_config_map(namespace, &desired).await?;
                    debug!(namespace = %namespace, name = %name, "Replaced config object");
                }
                None => {
                    self.cluster.create_config_map(namespace, &desired).await?;
                    debug!(namespace = %namespace, name = %name, "Created config object");
                }
            }
            Ok(())
        })
        .await?;

        info!(namespace = %namespace, name = %name, session_id = %owner.session_id, "Applied proxy config");
        Ok(())
    }

    /// Delete the session's config object; already-gone is fine
    pub async fn delete_config(&self, namespace: &str, name: &str) -> Result<()> {
        self.cluster.delete_config_map(namespace, name).await?;
        info!(namespace = %namespace, name = %name, "Deleted proxy config");
        Ok(())
    }

    /// List every config object meshtap created, across namespaces
    pub async fn list_managed_configs(&self) -> Result<Vec<ConfigMap>> {
        self.cluster
            .list_config_maps(None, &managed_config_selector())
            .await
    }

    /// Current target port of the service's first port
    pub async fn service_target_port(&self, namespace: &str, service: &str) -> Result<i32> {
        let svc = self
            .cluster
            .get_service(namespace, service)
            .await?
            .ok_or_else(|| Error::not_found("service", format!("{}/{}", namespace, service)))?;
        workload::first_target_port(&svc)
    }

    /// Fail fast when the deployment is missing
    pub async fn ensure_deployment_exists(&self, namespace: &str, deployment: &str) -> Result<()> {
        self.cluster
            .get_deployment(namespace, deployment)
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::not_found("deployment", format!("{}/{}", namespace, deployment)))
    }

    /// Add (or refresh) the sidecar on the deployment, then restart it so
    /// pods pick up the current config object
    ///
    /// Waiting for the rollout to begin is best effort: a slow controller
    /// only produces a warning.
    pub async fn inject_sidecar(
        &self,
        namespace: &str,
        deployment: &str,
        config_ref: &str,
    ) -> Result<()> {
        let resource = format!("deployment/{}/{}", namespace, deployment);
        retry_on_conflict(&self.conflict_retry, &resource, || async {
            let mut d = self.fetch_deployment(namespace, deployment).await?;
            workload::ensure_sidecar(&mut d, &self.envoy, config_ref)?;
            self.cluster.replace_deployment(namespace, &d).await?;
            Ok(())
        })
        .await?;
        info!(namespace = %namespace, deployment = %deployment, config = %config_ref, "Injected sidecar");

        self.rolling_restart(namespace, deployment).await?;
        self.wait_rollout_started(namespace, deployment).await;
        Ok(())
    }

    /// Remove the sidecar container and its volumes
    pub async fn remove_sidecar(&self, namespace: &str, deployment: &str) -> Result<()> {
        let resource = format!("deployment/{}/{}", namespace, deployment);
        let container = self.envoy.container_name.clone();
        let removed = retry_on_conflict(&self.conflict_retry, &resource, || async {
            let mut d = self.fetch_deployment(namespace, deployment).await?;
            if !workload::strip_sidecar(&mut d, &container) {
                return Ok(false);
            }
            self.cluster.replace_deployment(namespace, &d).await?;
            Ok(true)
        })
        .await?;

        if removed {
            info!(namespace = %namespace, deployment = %deployment, "Removed sidecar");
        } else {
            debug!(namespace = %namespace, deployment = %deployment, "No sidecar to remove");
        }
        Ok(())
    }

    /// Point the service's first port at `target_port`
    pub async fn redirect_traffic(
        &self,
        namespace: &str,
        service: &str,
        target_port: i32,
    ) -> Result<()> {
        let resource = format!("service/{}/{}", namespace, service);
        retry_on_conflict(&self.conflict_retry, &resource, || async {
            let mut svc = self
                .cluster
                .get_service(namespace, service)
                .await?
                .ok_or_else(|| {
                    Error::not_found("service", format!("{}/{}", namespace, service))
                })?;
            workload::set_first_target_port(&mut svc, target_port)?;
            self.cluster.replace_service(namespace, &svc).await?;
            Ok(())
        })
        .await?;

        info!(namespace = %namespace, service = %service, target_port, "Redirected service traffic");
        Ok(())
    }

    /// Stamp the restart annotation so every pod is recreated
    pub async fn rolling_restart(&self, namespace: &str, deployment: &str) -> Result<()> {
        let resource = format!("deployment/{}/{}", namespace, deployment);
        let stamp = Utc::now().to_rfc3339();
        retry_on_conflict(&self.conflict_retry, &resource, || async {
            let mut d = self.fetch_deployment(namespace, deployment).await?;
            workload::stamp_restart(&mut d, &stamp)?;
            self.cluster.replace_deployment(namespace, &d).await?;
            Ok(())
        })
        .await?;

        debug!(namespace = %namespace, deployment = %deployment, restarted_at = %stamp, "Triggered rolling restart");
        Ok(())
    }

    /// Wait until every desired replica is updated and ready
    pub async fn wait_ready(&self, namespace: &str, deployment: &str) -> Result<()> {
        let msg = format!(
            "deployment {}/{} not ready after {}s",
            namespace,
            deployment,
            self.rollout_timeout.as_secs()
        );
        poll_until(self.rollout_timeout, self.poll_interval, msg, || async {
            let d = self.fetch_deployment(namespace, deployment).await?;
            Ok(workload::rollout_ready(&d))
        })
        .await?;

        info!(namespace = %namespace, deployment = %deployment, "Deployment ready");
        Ok(())
    }

    /// Rollout health of the deployment; read failures map to [`DeploymentHealth::Error`]
    pub async fn deployment_health(&self, namespace: &str, deployment: &str) -> DeploymentHealth {
        match self.cluster.get_deployment(namespace, deployment).await {
            Ok(None) => DeploymentHealth::NotFound,
            Ok(Some(d)) => match d.status {
                None => DeploymentHealth::Unknown,
                Some(status) if status.replicas.unwrap_or(0) == status.ready_replicas.unwrap_or(0) => {
                    DeploymentHealth::Ready
                }
                Some(_) => DeploymentHealth::NotReady,
            },
            Err(e) => {
                warn!(namespace = %namespace, deployment = %deployment, error = %e, "Failed to read deployment status");
                DeploymentHealth::Error
            }
        }
    }

    /// Whether the service exists; read failures map to [`ServiceHealth::Error`]
    pub async fn service_health(&self, namespace: &str, service: &str) -> ServiceHealth {
        match self.cluster.get_service(namespace, service).await {
            Ok(Some(_)) => ServiceHealth::Active,
            Ok(None) => ServiceHealth::NotFound,
            Err(e) => {
                warn!(namespace = %namespace, service = %service, error = %e, "Failed to read service");
                ServiceHealth::Error
            }
        }
    }

    async fn wait_rollout_started(&self, namespace: &str, deployment: &str) {
        let result = poll_until(
            self.rollout_start_timeout,
            self.poll_interval,
            format!("rollout of {}/{} did not start", namespace, deployment),
            || async {
                let d = self.fetch_deployment(namespace, deployment).await?;
                Ok(workload::rollout_started(&d))
            },
        )
        .await;

        if let Err(e) = result {
            warn!(namespace = %namespace, deployment = %deployment, error = %e, "Rollout did not start in time, continuing");
        }
    }

    async fn fetch_deployment(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<k8s_openapi::api::apps::v1::Deployment> {
        self.cluster
            .get_deployment(namespace, deployment)
            .await?
            .ok_or_else(|| Error::not_found("deployment", format!("{}/{}", namespace, deployment)))
    }
}
