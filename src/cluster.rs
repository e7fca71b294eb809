//! Cluster API seam
//!
//! Everything meshtap does to a cluster goes through [`ClusterClient`]: a
//! handful of get/replace/list primitives on Deployments, Services, ConfigMaps
//! and Pods plus remote exec. No other resource kinds are touched. Nothing is
//! cached; callers re-read before every write.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Trait abstracting the cluster operations used by the control plane
///
/// Gets return `Ok(None)` for missing objects; writes surface API errors
/// unchanged so callers can tell conflicts apart.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Replace a Deployment (optimistic: carries the resourceVersion it was read at)
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Replace a Service
    async fn replace_service(&self, namespace: &str, service: &Service)
        -> Result<Service, Error>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error>;

    /// Replace a ConfigMap
    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error>;

    /// Delete a ConfigMap; a missing object is not an error
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List ConfigMaps by label selector, in one namespace or (None) all of them
    async fn list_config_maps(
        &self,
        namespace: Option<String>,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error>;

    /// List Pods by label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error>;

    /// Run `command` in a container and return its stdout
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String, Error>;
}

/// Real cluster client backed by `kube::Api`
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a kube get result so that 404 becomes `None`
fn optional<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn object_name<K: kube::Resource>(obj: &K) -> Result<String, Error> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation("object has no metadata.name"))
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "Exec stream closed early");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(deployment)?;
        Ok(api
            .replace(&name, &PostParams::default(), deployment)
            .await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(service)?;
        Ok(api.replace(&name, &PostParams::default(), service).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn replace_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = object_name(config_map)?;
        Ok(api
            .replace(&name, &PostParams::default(), config_map)
            .await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_config_maps(
        &self,
        namespace: Option<String>,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        let api: Api<ConfigMap> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = api
            .exec(pod, command, &params)
            .await
            .map_err(|e| Error::exec(pod, e.to_string()))?;

        // Drain both streams together; a full stderr pipe would stall stdout
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_all(stdout_reader), read_all(stderr_reader));

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::exec(pod, e.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                let message = status
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| stderr.trim().to_string());
                return Err(Error::exec(pod, message));
            }
        }

        Ok(stdout)
    }
}
