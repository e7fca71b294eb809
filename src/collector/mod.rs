//! Capture harvesting
//!
//! [`TapCollector`] pulls capture files out of running sidecars over remote
//! exec, parses them into [`RecordedEntry`] values and appends them to the
//! entry store. Harvesting is idempotent (files are marked processed) and
//! tolerant: a failing pod or file is logged and skipped.
//!
//! Pods are harvested concurrently; files within a pod are read with bounded
//! concurrency. A liveness guard on the session is re-checked before every
//! pod, file and read attempt so a harvest racing a stop winds down quickly.

pub mod parse;

use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::{CollectorSettings, EnvoySettings};
use crate::model::{RecordedEntry, RecordingSession, SessionStatus};
use crate::store::{EntryStore, SessionStore};
use crate::{Error, Result};

pub use parse::{parse_capture, CaptureOrigin};

/// Which session states a harvest keeps running for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Only RECORDING sessions (polling, on-demand, export)
    Recording,
    /// RECORDING or STOPPING (the last harvest of a stop)
    Draining,
}

impl Liveness {
    fn accepts(self, status: SessionStatus) -> bool {
        match self {
            Self::Recording => status == SessionStatus::Recording,
            Self::Draining => matches!(status, SessionStatus::Recording | SessionStatus::Stopping),
        }
    }
}

/// Harvests capture files from sidecars into the entry store
pub struct TapCollector {
    cluster: Arc<dyn ClusterClient>,
    sessions: SessionStore,
    entries: EntryStore,
    settings: CollectorSettings,
    container_name: String,
    tap_dir: String,
}

impl TapCollector {
    /// Create a collector
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        sessions: SessionStore,
        entries: EntryStore,
        settings: CollectorSettings,
        envoy: &EnvoySettings,
    ) -> Self {
        Self {
            cluster,
            sessions,
            entries,
            settings,
            container_name: envoy.container_name.clone(),
            tap_dir: envoy.tap_dir.trim_end_matches('/').to_string(),
        }
    }

    /// Harvest a RECORDING session; returns the number of newly stored entries
    pub async fn harvest(&self, session: &RecordingSession) -> Result<usize> {
        self.harvest_with(session, Liveness::Recording).await
    }

    /// Harvest with an explicit liveness guard
    pub async fn harvest_with(
        &self,
        session: &RecordingSession,
        liveness: Liveness,
    ) -> Result<usize> {
        let id = session.session_id.as_str();
        if !self.is_live(id, liveness).await {
            debug!(session_id = %id, "Session not live, skipping harvest");
            return Ok(0);
        }

        let pods = self.ready_pods(session).await;
        let per_pod = join_all(
            pods.iter()
                .map(|pod| self.harvest_pod(session, pod, liveness)),
        )
        .await;
        let total: usize = per_pod.into_iter().sum();

        if total > 0 {
            info!(session_id = %id, entries = total, "Harvested captures");
        } else {
            debug!(session_id = %id, "Harvest found nothing new");
        }
        Ok(total)
    }

    /// Copy unparsed capture files into `dir` as `<service>__<pod>__<file>`
    pub async fn export_raw(&self, session: &RecordingSession, dir: &Path) -> Result<usize> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::internal_with_context("export_raw", e.to_string()))?;

        let pods = self.ready_pods(session).await;
        let per_pod = join_all(pods.iter().map(|pod| self.export_pod(session, pod, dir))).await;
        let total = per_pod.into_iter().sum();
        info!(session_id = %session.session_id, files = total, dir = %dir.display(), "Exported raw captures");
        Ok(total)
    }

    async fn is_live(&self, session_id: &str, liveness: Liveness) -> bool {
        match self.sessions.load(session_id).await {
            Ok(Some(s)) => liveness.accepts(s.status),
            Ok(None) => false,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Session considered inactive");
                false
            }
        }
    }

    /// Pods behind the service whose sidecar is running, ready and started
    async fn ready_pods(&self, session: &RecordingSession) -> Vec<Pod> {
        let selector = format!("{}={}", self.settings.pod_label_key, session.service_name);
        let pods = match self.cluster.list_pods(&session.namespace, &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(session_id = %session.session_id, selector = %selector, error = %e, "Failed to list pods");
                return Vec::new();
            }
        };
        pods.into_iter()
            .filter(|p| {
                let ready = sidecar_ready(p, &self.container_name);
                if !ready {
                    debug!(pod = %pod_name(p), "Sidecar not ready, skipping pod");
                }
                ready
            })
            .collect()
    }

    async fn harvest_pod(
        &self,
        session: &RecordingSession,
        pod: &Pod,
        liveness: Liveness,
    ) -> usize {
        let id = session.session_id.as_str();
        let pod_name = pod_name(pod);
        if !self.is_live(id, liveness).await {
            return 0;
        }

        let files = self.list_files(&session.namespace, pod_name).await;
        debug!(session_id = %id, pod = %pod_name, files = files.len(), "Listed capture files");

        let results: Vec<bool> = stream::iter(files)
            .map(|file| async move {
                match self
                    .harvest_file(session, pod_name, &file, liveness)
                    .await
                {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!(session_id = %id, pod = %pod_name, file = %file, error = %e, "Failed to harvest capture file");
                        false
                    }
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        results.into_iter().filter(|stored| *stored).count()
    }

    async fn harvest_file(
        &self,
        session: &RecordingSession,
        pod: &str,
        file: &str,
        liveness: Liveness,
    ) -> Result<bool> {
        let id = session.session_id.as_str();
        if !self.is_live(id, liveness).await {
            return Ok(false);
        }

        // Each pod has its own tap volume, so file names only make sense per pod
        let file_key = format!("{}/{}", pod, file);
        if self.entries.is_processed(id, &file_key).await? {
            return Ok(false);
        }

        let Some(content) = self
            .read_with_retry(&session.namespace, pod, file, id, liveness)
            .await
        else {
            return Ok(false);
        };

        let origin = CaptureOrigin {
            recording_id: id,
            namespace: &session.namespace,
            service_name: &session.service_name,
            pod,
            source_file: file,
        };
        let entry: RecordedEntry = parse_capture(&content, &origin, self.settings.max_body_bytes)?;

        // Claim the file first so a concurrent harvest cannot store it twice
        if !self.entries.mark_processed(id, &file_key).await? {
            return Ok(false);
        }
        if let Err(e) = self.entries.append(id, std::slice::from_ref(&entry)).await {
            // Release the claim so the next harvest picks the file up again
            if let Err(release) = self.entries.unmark_processed(id, &file_key).await {
                warn!(session_id = %id, file = %file_key, error = %release, "Failed to release capture file claim");
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn export_pod(&self, session: &RecordingSession, pod: &Pod, dir: &Path) -> usize {
        let id = session.session_id.as_str();
        let pod_name = pod_name(pod);
        let files = self.list_files(&session.namespace, pod_name).await;

        let results: Vec<bool> = stream::iter(files)
            .map(|file| async move {
                let Some(content) = self
                    .read_with_retry(&session.namespace, pod_name, &file, id, Liveness::Recording)
                    .await
                else {
                    return false;
                };
                let base = file.rsplit('/').next().unwrap_or(file.as_str());
                let out = dir.join(format!("{}__{}__{}", session.service_name, pod_name, base));
                match tokio::fs::write(&out, content.as_bytes()).await {
                    Ok(()) => {
                        debug!(file = %out.display(), "Exported raw capture");
                        true
                    }
                    Err(e) => {
                        warn!(pod = %pod_name, file = %file, error = %e, "Failed to export raw capture");
                        false
                    }
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        results.into_iter().filter(|ok| *ok).count()
    }

    async fn list_files(&self, namespace: &str, pod: &str) -> Vec<String> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("ls -1 {}/*.json 2>/dev/null || true", self.tap_dir),
        ];
        match self.exec_with_retry(namespace, pod, command).await {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                warn!(pod = %pod, error = %e, "Failed to list capture files");
                Vec::new()
            }
        }
    }

    /// Read a file, retrying while it is still empty (listed before flushed)
    async fn read_with_retry(
        &self,
        namespace: &str,
        pod: &str,
        file: &str,
        session_id: &str,
        liveness: Liveness,
    ) -> Option<String> {
        for attempt in 1..=self.settings.read_retry_max.max(1) {
            if !self.is_live(session_id, liveness).await {
                debug!(session_id = %session_id, file = %file, "Session stopped during read");
                return None;
            }
            match self.read_file(namespace, pod, file).await {
                Ok(content) if !content.trim().is_empty() => return Some(content),
                Ok(_) => debug!(pod = %pod, file = %file, attempt, "Capture file still empty"),
                Err(e) => debug!(pod = %pod, file = %file, attempt, error = %e, "Capture read failed"),
            }
            tokio::time::sleep(self.settings.read_retry_sleep()).await;
        }

        if !self.is_live(session_id, liveness).await {
            return None;
        }
        match self.read_file(namespace, pod, file).await {
            Ok(content) if !content.trim().is_empty() => Some(content),
            _ => None,
        }
    }

    async fn read_file(&self, namespace: &str, pod: &str, file: &str) -> Result<String> {
        self.exec_with_retry(namespace, pod, vec!["cat".to_string(), file.to_string()])
            .await
    }

    /// Exec with linear backoff on transient failures; an absent sidecar
    /// container yields empty output
    async fn exec_with_retry(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let max_attempts = self.settings.exec_retry_max.max(1);
        let mut attempt = 1u32;
        loop {
            match self
                .cluster
                .exec(namespace, pod, &self.container_name, command.clone())
                .await
            {
                Ok(out) => return Ok(out),
                Err(e) if e.is_container_missing() => {
                    debug!(pod = %pod, container = %self.container_name, "Sidecar container absent");
                    return Ok(String::new());
                }
                Err(e) if e.is_retryable_exec() && attempt < max_attempts => {
                    let backoff = self.settings.exec_retry_sleep() * attempt;
                    warn!(
                        pod = %pod,
                        attempt,
                        max_attempts,
                        delay_ms = backoff.as_millis(),
                        error = %e,
                        "Exec failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// Running pod whose sidecar container is both ready and started
pub fn sidecar_ready(pod: &Pod, container_name: &str) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    let declared = pod
        .spec
        .as_ref()
        .is_some_and(|s| s.containers.iter().any(|c| c.name == container_name));
    if !declared {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .and_then(|statuses| statuses.iter().find(|s| s.name == container_name))
        .is_some_and(|s| s.ready && s.started == Some(true))
}
