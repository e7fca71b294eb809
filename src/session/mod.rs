//! Session lifecycle
//!
//! [`SessionManager`] is the surface the orchestration layer drives: it
//! starts sessions (config push → sidecar inject → traffic redirect →
//! readiness wait), mutates interception rules on live sessions, serves
//! status and entries, and tears sessions down again.
//!
//! Teardown is serialized per session with an async mutex so an explicit
//! stop, an auto-stop and a rule removal that empties the session never run
//! their cluster edits interleaved. Cluster objects themselves are still
//! protected only by conflict retries in [`SidecarController`].

mod requests;
pub mod sweep;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterClient;
use crate::collector::{Liveness, TapCollector};
use crate::config::{ControlPlaneConfig, SessionSettings};
use crate::model::{
    config_object_name, generate_session_id, InterceptionRule, PathMethodRule, RecordedEntry,
    RecordingSession, SessionKind, SessionStatus,
};
use crate::render::{ConfigRenderer, RenderRequest, RenderedConfig};
use crate::scheduler::AutoStopScheduler;
use crate::sidecar::{ConfigOwner, SidecarController};
use crate::store::Stores;
use crate::{Error, Result};

pub use requests::{
    ExportSummary, InterceptionRulesRequest, RecoveryReport, RuleKeysRequest,
    SessionStatusView, StartHybridRequest, StartInterceptionRequest, StartRecordingRequest,
};
pub use sweep::spawn_sweeps;

/// Drives recording and interception sessions end to end
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    renderer: ConfigRenderer,
    sidecar: SidecarController,
    collector: TapCollector,
    stores: Stores,
    scheduler: AutoStopScheduler,
    settings: SessionSettings,
    export_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Resolved workload a new session will attach to
struct Target {
    namespace: String,
    service_name: String,
    deployment_name: String,
    original_port: i32,
}

/// Failures collected by the best-effort teardown steps
#[derive(Default)]
struct StopReport {
    failures: Vec<String>,
    first: Option<Error>,
}

impl StopReport {
    fn note(&mut self, session_id: &str, step: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!(session_id = %session_id, step = %step, error = %e, "Teardown step failed");
            self.failures.push(format!("{}: {}", step, e));
            self.first.get_or_insert(e);
        }
    }
}

impl SessionManager {
    /// Wire a manager over a cluster client and stores
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        stores: Stores,
        config: &ControlPlaneConfig,
    ) -> Result<Self> {
        let renderer = ConfigRenderer::new(config.envoy.clone())?;
        let sidecar = SidecarController::new(cluster.clone(), config.envoy.clone(), &config.session);
        let collector = TapCollector::new(
            cluster,
            stores.sessions.clone(),
            stores.entries.clone(),
            config.collector.clone(),
            &config.envoy,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                renderer,
                sidecar,
                collector,
                stores,
                scheduler: AutoStopScheduler::new(),
                settings: config.session.clone(),
                export_dir: config.collector.export_dir.clone(),
                locks: DashMap::new(),
            }),
        })
    }

    /// Session timing settings
    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Pending auto-stop timers
    pub fn scheduler(&self) -> &AutoStopScheduler {
        &self.inner.scheduler
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Start a record-only session
    pub async fn start_recording(&self, req: StartRecordingRequest) -> Result<RecordingSession> {
        if req.rules.is_empty() {
            return Err(Error::validation("at least one recording rule is required"));
        }
        let target = self
            .resolve_target(&req.namespace, &req.service_name, req.deployment_name)
            .await?;

        let mut session = self.new_session(SessionKind::Recording, target, req.duration_seconds);
        session.requested_recording_rules =
            req.rules.iter().map(PathMethodRule::normalized).collect();
        session.tap_prefix = self.inner.renderer.record_tap_prefix();
        self.launch(session).await
    }

    /// Start a session that records and intercepts
    pub async fn start_hybrid(&self, req: StartHybridRequest) -> Result<RecordingSession> {
        if req.recording_rules.is_empty() && req.interception_rules.is_empty() {
            return Err(Error::validation(
                "a hybrid session needs recording or interception rules",
            ));
        }
        let target = self
            .resolve_target(&req.namespace, &req.service_name, req.deployment_name)
            .await?;

        let mut session = self.new_session(SessionKind::Hybrid, target, req.duration_seconds);
        session.requested_recording_rules = req
            .recording_rules
            .iter()
            .map(PathMethodRule::normalized)
            .collect();
        upsert_rules(&mut session, req.interception_rules);
        session.tap_prefix = self.inner.renderer.record_tap_prefix();
        self.launch(session).await
    }

    /// Start an interception session, or add the rules to the service's
    /// active session when there is one
    pub async fn start_interception(
        &self,
        req: StartInterceptionRequest,
    ) -> Result<RecordingSession> {
        if req.rules.is_empty() {
            return Err(Error::validation("at least one interception rule is required"));
        }
        if let Some(existing) = self
            .inner
            .stores
            .sessions
            .find_active_for_service(&req.namespace, &req.service_name)
            .await?
        {
            info!(
                session_id = %existing.session_id,
                service = %req.service_name,
                "Service already has an active session, adding interception rules to it"
            );
            return self
                .add_interception_rules(&existing.session_id, req.rules)
                .await;
        }

        let target = self
            .resolve_target(&req.namespace, &req.service_name, req.deployment_name)
            .await?;
        let mut session =
            self.new_session(SessionKind::Interception, target, req.duration_seconds);
        upsert_rules(&mut session, req.rules);
        session.tap_enabled = req.tap_enabled;
        session.tap_prefix = if req.tap_enabled {
            self.inner.renderer.intercept_tap_prefix()
        } else {
            String::new()
        };
        self.launch(session).await
    }

    async fn resolve_target(
        &self,
        namespace: &str,
        service: &str,
        deployment: Option<String>,
    ) -> Result<Target> {
        if namespace.trim().is_empty() || service.trim().is_empty() {
            return Err(Error::validation("namespace and service name are required"));
        }
        if let Some(active) = self
            .inner
            .stores
            .sessions
            .find_active_for_service(namespace, service)
            .await?
        {
            return Err(Error::validation(format!(
                "service {}/{} already has active session {}",
                namespace, service, active.session_id
            )));
        }

        let deployment_name = deployment
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| service.to_string());
        let original_port = self
            .inner
            .sidecar
            .service_target_port(namespace, service)
            .await?;
        if original_port == self.inner.sidecar.proxy_port() {
            return Err(Error::validation(format!(
                "service {}/{} already targets the proxy port {}",
                namespace, service, original_port
            )));
        }
        self.inner
            .sidecar
            .ensure_deployment_exists(namespace, &deployment_name)
            .await?;

        Ok(Target {
            namespace: namespace.to_string(),
            service_name: service.to_string(),
            deployment_name,
            original_port,
        })
    }

    fn new_session(
        &self,
        kind: SessionKind,
        target: Target,
        duration_seconds: Option<u64>,
    ) -> RecordingSession {
        let now = Utc::now();
        let session_id = generate_session_id(kind, now);
        RecordingSession {
            config_object_name: config_object_name(kind, &session_id),
            session_id,
            kind,
            namespace: target.namespace,
            service_name: target.service_name,
            deployment_name: target.deployment_name,
            original_port: target.original_port,
            proxy_port: self.inner.sidecar.proxy_port(),
            status: SessionStatus::Recording,
            recording_rules: Vec::new(),
            requested_recording_rules: Vec::new(),
            interception_rules: Vec::new(),
            tap_enabled: true,
            tap_prefix: String::new(),
            started_at: now,
            stopped_at: None,
            duration_seconds: self.effective_duration(duration_seconds),
            expires_at: None,
            error_message: None,
        }
    }

    fn effective_duration(&self, requested: Option<u64>) -> Option<u64> {
        let settings = &self.inner.settings;
        match requested.filter(|secs| *secs > 0) {
            Some(secs) => Some(secs),
            None if settings.apply_default_duration && settings.default_duration_secs > 0 => {
                Some(settings.default_duration_secs)
            }
            None => None,
        }
    }

    /// Render, persist, deploy and arm the auto-stop
    async fn launch(&self, mut session: RecordingSession) -> Result<RecordingSession> {
        // Rendering validates every rule before the cluster is touched
        let rendered = self.render(&session)?;
        session.recording_rules = rendered.recording_rules;
        self.inner.stores.sessions.save(&session).await?;
        info!(
            session_id = %session.session_id,
            kind = ?session.kind,
            namespace = %session.namespace,
            service = %session.service_name,
            original_port = session.original_port,
            "Starting session"
        );

        if let Err(e) = self.deploy(&session, &rendered.document).await {
            error!(session_id = %session.session_id, error = %e, "Session start failed");
            if let Err(store_err) = self
                .inner
                .stores
                .sessions
                .set_error(&session.session_id, &e.to_string())
                .await
            {
                warn!(session_id = %session.session_id, error = %store_err, "Failed to record session error");
            }
            return Err(e);
        }

        session.expires_at = session
            .duration_seconds
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
        self.inner.stores.sessions.save(&session).await?;
        if let Some(secs) = session.duration_seconds {
            self.arm_auto_stop(&session.session_id, Duration::from_secs(secs));
        }

        info!(
            session_id = %session.session_id,
            duration_secs = ?session.duration_seconds,
            "Session recording"
        );
        Ok(session)
    }

    async fn deploy(&self, session: &RecordingSession, document: &str) -> Result<()> {
        let sidecar = &self.inner.sidecar;
        let ns = &session.namespace;
        sidecar
            .apply_config(ns, &session.config_object_name, document, &owner_of(session))
            .await?;
        sidecar
            .inject_sidecar(ns, &session.deployment_name, &session.config_object_name)
            .await?;
        sidecar
            .redirect_traffic(ns, &session.service_name, session.proxy_port)
            .await?;
        sidecar.wait_ready(ns, &session.deployment_name).await
    }

    fn render(&self, session: &RecordingSession) -> Result<RenderedConfig> {
        let request = RenderRequest {
            app_port: session.original_port,
            recording_rules: &session.requested_recording_rules,
            interception_rules: &session.interception_rules,
            tap_enabled: session.tap_enabled,
            tap_path_prefix: Some(session.tap_prefix.clone()).filter(|p| !p.is_empty()),
        };
        self.inner.renderer.render(&request)
    }

    fn arm_auto_stop(&self, session_id: &str, delay: Duration) {
        let manager = self.clone();
        self.inner
            .scheduler
            .schedule(session_id, delay, move |id| async move {
                info!(session_id = %id, "Auto-stopping expired session");
                if let Err(e) = manager.stop(&id).await {
                    warn!(session_id = %id, error = %e, "Auto-stop failed");
                }
            });
    }

    // =========================================================================
    // Stop
    // =========================================================================

    /// Stop a session and restore the workload
    ///
    /// Every teardown step runs even when an earlier one failed; the session
    /// ends STOPPED, or ERROR carrying the failed steps.
    pub async fn stop(&self, session_id: &str) -> Result<RecordingSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.stop_locked(session_id).await
    }

    async fn stop_locked(&self, session_id: &str) -> Result<RecordingSession> {
        if self.inner.scheduler.cancel(session_id) {
            debug!(session_id = %session_id, "Cancelled pending auto-stop");
        }

        let sessions = &self.inner.stores.sessions;
        let session = sessions.require(session_id).await?;
        if session.status == SessionStatus::Stopped {
            info!(session_id = %session_id, "Session already stopped");
            return Ok(session);
        }

        sessions
            .update_status(session_id, SessionStatus::Stopping)
            .await?;
        info!(session_id = %session_id, status = %session.status, "Stopping session");

        let sidecar = &self.inner.sidecar;
        let ns = &session.namespace;
        let mut report = StopReport::default();

        report.note(
            session_id,
            "restore traffic",
            sidecar
                .redirect_traffic(ns, &session.service_name, session.original_port)
                .await,
        );
        report.note(
            session_id,
            "remove sidecar",
            sidecar.remove_sidecar(ns, &session.deployment_name).await,
        );

        if session.tap_enabled {
            match self
                .inner
                .collector
                .harvest_with(&session, Liveness::Draining)
                .await
            {
                Ok(count) => debug!(session_id = %session_id, entries = count, "Final harvest done"),
                Err(e) => warn!(session_id = %session_id, error = %e, "Final harvest failed"),
            }
        }

        report.note(
            session_id,
            "wait ready",
            sidecar.wait_ready(ns, &session.deployment_name).await,
        );
        if let Err(e) = sidecar.delete_config(ns, &session.config_object_name).await {
            warn!(session_id = %session_id, error = %e, "Failed to delete proxy config");
        }

        if let Some(first) = report.first {
            let message = format!("stop incomplete: {}", report.failures.join("; "));
            sessions.set_error(session_id, &message).await?;
            error!(session_id = %session_id, error = %message, "Session stopped with errors");
            return Err(first);
        }

        sessions
            .update_status(session_id, SessionStatus::Stopped)
            .await?;
        info!(session_id = %session_id, "Session stopped");

        Ok(sessions.load(session_id).await?.unwrap_or_else(|| {
            let mut stopped = session;
            stopped.status = SessionStatus::Stopped;
            stopped
        }))
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(session_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The session with entry count and workload health
    pub async fn status(&self, session_id: &str) -> Result<SessionStatusView> {
        let session = self.inner.stores.sessions.require(session_id).await?;
        let entry_count = self.inner.stores.entries.count(session_id).await?;
        let (deployment_status, service_status) = tokio::join!(
            self.inner
                .sidecar
                .deployment_health(&session.namespace, &session.deployment_name),
            self.inner
                .sidecar
                .service_health(&session.namespace, &session.service_name),
        );
        Ok(SessionStatusView {
            session,
            entry_count,
            deployment_status,
            service_status,
        })
    }

    /// Page through stored entries, harvesting first while the session records
    pub async fn entries(
        &self,
        session_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedEntry>> {
        let session = self.inner.stores.sessions.require(session_id).await?;
        if session.is_active() && session.tap_enabled {
            if let Err(e) = self.inner.collector.harvest(&session).await {
                warn!(session_id = %session_id, error = %e, "On-demand harvest failed");
            }
        }
        self.inner
            .stores
            .entries
            .list(session_id, offset, limit)
            .await
    }

    /// Number of stored entries
    pub async fn entry_count(&self, session_id: &str) -> Result<usize> {
        self.inner.stores.sessions.require(session_id).await?;
        self.inner.stores.entries.count(session_id).await
    }

    /// Harvest now; returns the number of new entries
    pub async fn collect_now(&self, session_id: &str) -> Result<usize> {
        let session = self.inner.stores.sessions.require(session_id).await?;
        self.inner.collector.harvest(&session).await
    }

    /// Copy the unparsed capture files to `<export_dir>/<subdir>` (default
    /// `<export_dir>/<id>`)
    ///
    /// `subdir` must be a relative path without `..` components.
    pub async fn export_raw(
        &self,
        session_id: &str,
        subdir: Option<&str>,
    ) -> Result<ExportSummary> {
        let directory = match subdir {
            Some(sub) => self.inner.export_dir.join(export_subdir(sub)?),
            None => self.inner.export_dir.join(session_id),
        };
        let session = self.inner.stores.sessions.require(session_id).await?;
        let files = self.inner.collector.export_raw(&session, &directory).await?;
        Ok(ExportSummary {
            session_id: session.session_id,
            directory,
            files,
        })
    }

    /// Every stored session, oldest first
    pub async fn list(&self) -> Result<Vec<RecordingSession>> {
        self.inner.stores.sessions.list_all().await
    }

    /// Drop a finished session together with its entries
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let session = self.inner.stores.sessions.require(session_id).await?;
        if !session.status.is_terminal() {
            return Err(Error::validation(format!(
                "session {} is {}; stop it before deleting",
                session_id, session.status
            )));
        }
        self.inner.stores.purge(session_id).await?;
        self.inner.locks.remove(session_id);
        info!(session_id = %session_id, "Deleted session");
        Ok(())
    }

    // =========================================================================
    // Rule mutation
    // =========================================================================

    /// Add interception rules; a rule for an existing (path, method) replaces it
    pub async fn add_interception_rules(
        &self,
        session_id: &str,
        rules: Vec<InterceptionRule>,
    ) -> Result<RecordingSession> {
        if rules.is_empty() {
            return Err(Error::validation("at least one interception rule is required"));
        }
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.require_recording(session_id).await?;
        upsert_rules(&mut session, rules);
        self.apply_rules(session).await
    }

    /// Remove the interception rules matching the given (path, method) pairs;
    /// a session left without rules is stopped
    pub async fn remove_interception_rules(
        &self,
        session_id: &str,
        keys: Vec<PathMethodRule>,
    ) -> Result<RecordingSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.require_recording(session_id).await?;
        let before = session.interception_rules.len();
        session
            .interception_rules
            .retain(|rule| !keys.iter().any(|k| rule.matches(&k.path, &k.method)));
        if session.interception_rules.len() == before {
            debug!(session_id = %session_id, "No interception rules matched");
            return Ok(session);
        }

        if session.has_no_rules() {
            info!(session_id = %session_id, "Last rule removed, stopping session");
            return self.stop_locked(session_id).await;
        }
        self.apply_rules(session).await
    }

    /// Swap the whole interception rule set; an empty set with nothing left to
    /// record stops the session
    pub async fn replace_interception_rules(
        &self,
        session_id: &str,
        rules: Vec<InterceptionRule>,
    ) -> Result<RecordingSession> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.require_recording(session_id).await?;
        session.interception_rules.clear();
        upsert_rules(&mut session, rules);

        if session.has_no_rules() {
            info!(session_id = %session_id, "Rule set emptied, stopping session");
            return self.stop_locked(session_id).await;
        }
        self.apply_rules(session).await
    }

    async fn require_recording(&self, session_id: &str) -> Result<RecordingSession> {
        let session = self.inner.stores.sessions.require(session_id).await?;
        if !session.is_active() {
            return Err(Error::validation(format!(
                "session {} is {}; rules can only change while recording",
                session_id, session.status
            )));
        }
        Ok(session)
    }

    /// Re-render, push the config object, persist and restart the pods
    async fn apply_rules(&self, mut session: RecordingSession) -> Result<RecordingSession> {
        let rendered = self.render(&session)?;
        session.recording_rules = rendered.recording_rules;

        let sidecar = &self.inner.sidecar;
        let ns = &session.namespace;
        sidecar
            .apply_config(
                ns,
                &session.config_object_name,
                &rendered.document,
                &owner_of(&session),
            )
            .await?;
        self.inner.stores.sessions.save(&session).await?;
        sidecar
            .rolling_restart(ns, &session.deployment_name)
            .await?;

        info!(
            session_id = %session.session_id,
            interception_rules = session.interception_rules.len(),
            recording_rules = session.recording_rules.len(),
            "Updated session rules"
        );
        Ok(session)
    }

    // =========================================================================
    // Startup recovery
    // =========================================================================

    /// Re-arm auto-stops of persisted RECORDING sessions; stop those already expired
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();
        for session in self.inner.stores.sessions.list_active().await? {
            let Some(expires_at) = session.expires_at else {
                continue;
            };
            let id = session.session_id;
            if expires_at <= now {
                info!(session_id = %id, "Session expired while the control plane was down");
                if let Err(e) = self.stop(&id).await {
                    warn!(session_id = %id, error = %e, "Failed to stop expired session");
                }
                report.stopped += 1;
            } else {
                let remaining = (expires_at - now).to_std().unwrap_or_default();
                self.arm_auto_stop(&id, remaining);
                report.rearmed += 1;
            }
        }
        info!(rearmed = report.rearmed, stopped = report.stopped, "Recovered persisted sessions");
        Ok(report)
    }
}

fn owner_of(session: &RecordingSession) -> ConfigOwner {
    ConfigOwner {
        session_id: session.session_id.clone(),
        service: session.service_name.clone(),
        deployment: session.deployment_name.clone(),
        original_port: session.original_port,
    }
}

/// Insert rules keyed by (path, method), replacing earlier ones
fn upsert_rules(session: &mut RecordingSession, rules: Vec<InterceptionRule>) {
    for mut rule in rules {
        if rule.service_name.is_empty() {
            rule.service_name = session.service_name.clone();
        }
        match session
            .interception_rules
            .iter_mut()
            .find(|existing| existing.matches(&rule.path, &rule.method))
        {
            Some(existing) => *existing = rule,
            None => session.interception_rules.push(rule),
        }
    }
}

/// Export target below the export root; only plain path segments are allowed
fn export_subdir(sub: &str) -> Result<&Path> {
    let path = Path::new(sub);
    let plain = !sub.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(path)
    } else {
        Err(Error::validation(format!(
            "export directory must be a relative path below the export root, got {:?}",
            sub
        )))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::CollectorSettings;
    use crate::model::MockResponse;

    /// Config with millisecond backoffs and one-second rollout ceilings
    pub fn fast_config() -> ControlPlaneConfig {
        ControlPlaneConfig {
            session: SessionSettings {
                conflict_backoff_ms: 1,
                poll_interval_ms: 1,
                rollout_timeout_secs: 1,
                rollout_start_timeout_secs: 1,
                ..Default::default()
            },
            collector: CollectorSettings {
                read_retry_sleep_ms: 1,
                exec_retry_sleep_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn record_request(duration_seconds: Option<u64>) -> StartRecordingRequest {
        StartRecordingRequest {
            namespace: "shop".to_string(),
            service_name: "orders".to_string(),
            deployment_name: None,
            rules: vec![PathMethodRule::new("/api", "GET")],
            duration_seconds,
        }
    }

    pub fn mock_rule(path: &str) -> InterceptionRule {
        InterceptionRule {
            service_name: "orders".to_string(),
            path: path.to_string(),
            method: "GET".to_string(),
            match_tokens: Vec::new(),
            mock_response: MockResponse {
                status_code: 503,
                body: "{\"down\":true}".to_string(),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::MockClusterClient;
    use crate::collector::fixtures::{capture, pod};
    use crate::sidecar::workload::fixtures::{app_deployment, app_service, with_status};
    use crate::sidecar::{
        first_target_port, has_sidecar, DeploymentHealth, ServiceHealth, CONFIG_DATA_KEY,
    };
    use crate::store::fixtures::recording_session;
    use mockall::Sequence;

    struct Harness {
        manager: SessionManager,
        cluster: Arc<FakeCluster>,
        stores: Stores,
    }

    fn harness_with(cluster: FakeCluster) -> Harness {
        let cluster = Arc::new(cluster);
        let stores = Stores::in_memory();
        let manager = SessionManager::new(cluster.clone(), stores.clone(), &fast_config()).unwrap();
        Harness {
            manager,
            cluster,
            stores,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeCluster::with_workload(
            app_deployment("orders"),
            app_service("orders", 8080),
        ))
    }

    impl Harness {
        fn service_port(&self) -> i32 {
            first_target_port(&self.cluster.service("shop", "orders").unwrap()).unwrap()
        }

        fn has_sidecar(&self) -> bool {
            has_sidecar(&self.cluster.deployment("shop", "orders").unwrap(), "envoy")
        }

        fn document(&self, session: &RecordingSession) -> Option<String> {
            self.cluster
                .config_map("shop", &session.config_object_name)
                .and_then(|cm| cm.data)
                .map(|data| data[CONFIG_DATA_KEY].clone())
        }

        async fn stored(&self, id: &str) -> RecordingSession {
            self.stores.sessions.require(id).await.unwrap()
        }
    }

    // ==========================================================================
    // Story Tests: Starting Sessions
    // ==========================================================================

    /// Story: A recording session pushes config, injects, redirects and waits
    #[tokio::test]
    async fn story_start_recording_wires_the_workload() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();

        assert!(session.session_id.starts_with("rec-"));
        assert_eq!(session.status, SessionStatus::Recording);
        assert_eq!(session.original_port, 8080);
        assert_eq!(session.proxy_port, 15006);
        assert_eq!(session.recording_rules, vec![PathMethodRule::new("/api", "GET")]);
        assert!(session.expires_at.is_none());

        assert_eq!(h.service_port(), 15006);
        assert!(h.has_sidecar());
        assert!(h.document(&session).unwrap().contains("/api"));
        assert_eq!(h.stored(&session.session_id).await, session);
        assert!(h.manager.scheduler().is_empty());
    }

    /// Story: A second session for the same service is refused
    #[tokio::test]
    async fn story_one_active_session_per_service() {
        let h = harness();
        h.manager.start_recording(record_request(None)).await.unwrap();

        let err = h
            .manager
            .start_recording(record_request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(h.manager.list().await.unwrap().len(), 1);
    }

    /// Story: Bad input is rejected before anything is written
    #[tokio::test]
    async fn story_validation_happens_before_mutation() {
        let h = harness();
        let mut req = record_request(None);
        req.rules.clear();
        assert!(matches!(
            h.manager.start_recording(req).await,
            Err(Error::Validation(_))
        ));

        let mut bad_path = record_request(None);
        bad_path.rules = vec![PathMethodRule::new("  ", "GET")];
        assert!(h.manager.start_recording(bad_path).await.is_err());

        assert!(h.manager.list().await.unwrap().is_empty());
        assert_eq!(h.service_port(), 8080);
        assert!(!h.has_sidecar());
        assert!(h.cluster.config_maps.lock().unwrap().is_empty());
    }

    /// Story: Unknown services and deployments surface as not found
    #[tokio::test]
    async fn story_missing_workload_is_not_found() {
        let h = harness();
        let mut req = record_request(None);
        req.service_name = "payments".to_string();
        let err = h.manager.start_recording(req).await.unwrap_err();
        assert!(err.is_not_found());

        let mut req = record_request(None);
        req.deployment_name = Some("orders-v2".to_string());
        let err = h.manager.start_recording(req).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(h.manager.list().await.unwrap().is_empty());
    }

    /// Story: A failure after the session is saved leaves it in ERROR
    #[tokio::test]
    async fn story_failed_deploy_marks_session_error() {
        let mut broken = app_deployment("orders");
        broken.spec.as_mut().unwrap().template.spec = None;
        let h = harness_with(FakeCluster::with_workload(broken, app_service("orders", 8080)));

        assert!(h.manager.start_recording(record_request(None)).await.is_err());

        let sessions = h.manager.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Error);
        assert!(sessions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("pod template"));
        assert!(h.manager.scheduler().is_empty());
    }

    /// Story: Hybrid sessions capture the intercepted paths too
    #[tokio::test]
    async fn story_hybrid_session_records_intercepted_paths() {
        let h = harness();
        let session = h
            .manager
            .start_hybrid(StartHybridRequest {
                namespace: "shop".to_string(),
                service_name: "orders".to_string(),
                deployment_name: None,
                recording_rules: vec![PathMethodRule::new("/api", "get")],
                interception_rules: vec![mock_rule("/api/pay")],
                duration_seconds: None,
            })
            .await
            .unwrap();

        assert!(session.session_id.starts_with("hyb-"));
        assert!(session.config_object_name.starts_with("envoy-hybrid-"));
        assert_eq!(
            session.recording_rules,
            vec![
                PathMethodRule::new("/api", "GET"),
                PathMethodRule::new("/api/pay", "GET")
            ]
        );
        assert!(h.document(&session).unwrap().contains("direct_response"));
    }

    /// Story: Interception against a recording service joins that session
    #[tokio::test]
    async fn story_interception_reuses_active_session() {
        let h = harness();
        let recording = h.manager.start_recording(record_request(None)).await.unwrap();

        let joined = h
            .manager
            .start_interception(StartInterceptionRequest {
                namespace: "shop".to_string(),
                service_name: "orders".to_string(),
                deployment_name: None,
                rules: vec![mock_rule("/api/pay")],
                tap_enabled: false,
                duration_seconds: None,
            })
            .await
            .unwrap();

        assert_eq!(joined.session_id, recording.session_id);
        assert_eq!(joined.interception_rules.len(), 1);
        assert!(joined
            .recording_rules
            .contains(&PathMethodRule::new("/api/pay", "GET")));
        assert!(h.document(&joined).unwrap().contains("direct_response"));
        assert_eq!(h.manager.list().await.unwrap().len(), 1);
    }

    // ==========================================================================
    // Story Tests: Stopping Sessions
    // ==========================================================================

    /// Story: Stopping before the timer fires restores everything and the
    /// auto-stop never runs
    #[tokio::test(start_paused = true)]
    async fn story_explicit_stop_beats_auto_stop() {
        let h = harness();
        let session = h.manager.start_recording(record_request(Some(5))).await.unwrap();
        let id = session.session_id.clone();
        assert!(session.expires_at.is_some());
        assert!(h.manager.scheduler().is_scheduled(&id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stopped = h.manager.stop(&id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(stopped.stopped_at.is_some());
        assert!(!h.manager.scheduler().is_scheduled(&id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stored = h.stored(&id).await;
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.stopped_at, stopped.stopped_at);
        assert_eq!(h.service_port(), 8080);
        assert!(!h.has_sidecar());
        assert!(h.document(&session).is_none());
    }

    /// Story: The timer tears the session down on expiry
    #[tokio::test(start_paused = true)]
    async fn story_auto_stop_tears_down_on_expiry() {
        let h = harness();
        let session = h.manager.start_recording(record_request(Some(5))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..50 {
            if h.stored(&session.session_id).await.status == SessionStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(h.stored(&session.session_id).await.status, SessionStatus::Stopped);
        assert_eq!(h.service_port(), 8080);
        assert!(!h.has_sidecar());
    }

    /// Story: Stop is idempotent and unknown sessions are not found
    #[tokio::test]
    async fn story_stop_twice_and_stop_unknown() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();

        h.manager.stop(&session.session_id).await.unwrap();
        let again = h.manager.stop(&session.session_id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Stopped);

        assert!(h.manager.stop("rec-missing").await.unwrap_err().is_not_found());
        assert!(h.manager.status("rec-missing").await.unwrap_err().is_not_found());
    }

    /// Story: The final harvest drains captures left in the sidecar
    #[tokio::test]
    async fn story_stop_harvests_remaining_captures() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();
        h.cluster.pods.lock().unwrap().push(pod("orders-a", true));
        h.cluster
            .add_capture("orders-a", "/var/log/envoy/taps/rec-1.json", capture("/api/orders", 200));

        h.manager.stop(&session.session_id).await.unwrap();

        assert_eq!(h.manager.entry_count(&session.session_id).await.unwrap(), 1);
    }

    /// Story: Teardown runs restore, remove, drain, wait, delete in that order
    #[tokio::test]
    async fn story_stop_runs_steps_in_order() {
        let stores = Stores::in_memory();
        let session = recording_session("rec-ordered");
        stores.sessions.save(&session).await.unwrap();

        let mut seq = Sequence::new();
        let mut mock = MockClusterClient::new();
        mock.expect_get_service()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| Ok(Some(app_service(name, 15006))));
        mock.expect_replace_service()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, svc| first_target_port(svc).unwrap() == 8080)
            .returning(|_, svc| Ok(svc.clone()));
        mock.expect_get_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let mut d = app_deployment("orders");
                crate::sidecar::ensure_sidecar(&mut d, &Default::default(), "envoy-tap-x")
                    .unwrap();
                Ok(Some(d))
            });
        mock.expect_replace_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, d| !has_sidecar(d, "envoy"))
            .returning(|_, d| Ok(d.clone()));
        mock.expect_list_pods()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Vec::new()));
        mock.expect_get_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(with_status(app_deployment("orders"), 2, 2, 2))));
        mock.expect_delete_config_map()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|ns, name| ns == "shop" && name == "envoy-tap-rec-ordered")
            .returning(|_, _| Ok(()));

        let manager = SessionManager::new(Arc::new(mock), stores.clone(), &fast_config()).unwrap();
        let stopped = manager.stop("rec-ordered").await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
    }

    /// Story: A failed teardown step still runs the rest and ends in ERROR
    #[tokio::test]
    async fn story_failed_restore_marks_error_but_finishes_teardown() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();
        h.cluster.services.lock().unwrap().clear();

        let err = h.manager.stop(&session.session_id).await.unwrap_err();
        assert!(err.is_not_found());

        let stored = h.stored(&session.session_id).await;
        assert_eq!(stored.status, SessionStatus::Error);
        assert!(stored
            .error_message
            .as_deref()
            .unwrap()
            .contains("restore traffic"));
        assert!(!h.has_sidecar());
        assert!(h.document(&session).is_none());
    }

    // ==========================================================================
    // Story Tests: Rule Mutation
    // ==========================================================================

    fn interception_request(tap_enabled: bool) -> StartInterceptionRequest {
        StartInterceptionRequest {
            namespace: "shop".to_string(),
            service_name: "orders".to_string(),
            deployment_name: None,
            rules: vec![mock_rule("/api/pay")],
            tap_enabled,
            duration_seconds: None,
        }
    }

    /// Story: Adding a rule for an existing path replaces it
    #[tokio::test]
    async fn story_add_rule_upserts_by_path_and_method() {
        let h = harness();
        let session = h
            .manager
            .start_interception(interception_request(false))
            .await
            .unwrap();
        assert!(session.session_id.starts_with("int-"));
        assert!(session.recording_rules.is_empty());

        let mut updated = mock_rule("/api/pay");
        updated.mock_response.status_code = 429;
        let session = h
            .manager
            .add_interception_rules(&session.session_id, vec![updated, mock_rule("/api/ship")])
            .await
            .unwrap();

        assert_eq!(session.interception_rules.len(), 2);
        assert_eq!(session.interception_rules[0].mock_response.status_code, 429);
        let document = h.document(&session).unwrap();
        assert!(document.contains("/api/ship"));
        assert!(document.contains("429"));
    }

    /// Story: Removing the last interception rule stops an interception session
    #[tokio::test]
    async fn story_removing_last_rule_stops_session() {
        let h = harness();
        let session = h
            .manager
            .start_interception(interception_request(false))
            .await
            .unwrap();

        let result = h
            .manager
            .remove_interception_rules(
                &session.session_id,
                vec![PathMethodRule::new("/api/pay", "get")],
            )
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Stopped);
        assert_eq!(h.service_port(), 8080);
        assert!(!h.has_sidecar());
    }

    /// Story: A hybrid session keeps recording after its interceptions go away
    #[tokio::test]
    async fn story_hybrid_survives_losing_interceptions() {
        let h = harness();
        let session = h
            .manager
            .start_hybrid(StartHybridRequest {
                namespace: "shop".to_string(),
                service_name: "orders".to_string(),
                deployment_name: None,
                recording_rules: vec![PathMethodRule::new("/api", "GET")],
                interception_rules: vec![mock_rule("/api/pay")],
                duration_seconds: None,
            })
            .await
            .unwrap();

        let session = h
            .manager
            .replace_interception_rules(&session.session_id, Vec::new())
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Recording);
        assert!(session.interception_rules.is_empty());
        assert_eq!(session.recording_rules, vec![PathMethodRule::new("/api", "GET")]);
        assert!(!h.document(&session).unwrap().contains("direct_response"));
    }

    /// Story: Rules cannot change once a session has stopped
    #[tokio::test]
    async fn story_rules_frozen_after_stop() {
        let h = harness();
        let session = h
            .manager
            .start_interception(interception_request(true))
            .await
            .unwrap();
        assert!(session.tap_prefix.ends_with("/fi-"));
        h.manager.stop(&session.session_id).await.unwrap();

        let err = h
            .manager
            .add_interception_rules(&session.session_id, vec![mock_rule("/api/ship")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h
            .manager
            .add_interception_rules(&session.session_id, Vec::new())
            .await
            .is_err());
    }

    // ==========================================================================
    // Story Tests: Reads, Export and Cleanup
    // ==========================================================================

    /// Story: Reading entries harvests on demand while recording
    #[tokio::test]
    async fn story_entries_harvest_on_demand() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();
        let id = session.session_id.clone();
        h.cluster.pods.lock().unwrap().push(pod("orders-a", true));
        h.cluster
            .add_capture("orders-a", "/var/log/envoy/taps/rec-1.json", capture("/api/orders", 200));
        h.cluster
            .add_capture("orders-a", "/var/log/envoy/taps/rec-2.json", capture("/api/orders/7", 404));

        let entries = h.manager.entries(&id, 0, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.recording_id == id));

        let page = h.manager.entries(&id, 1, Some(10)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(h.manager.collect_now(&id).await.unwrap(), 0);

        let view = h.manager.status(&id).await.unwrap();
        assert_eq!(view.entry_count, 2);
        assert_eq!(view.deployment_status, DeploymentHealth::Ready);
        assert_eq!(view.service_status, ServiceHealth::Active);

        assert!(h.manager.entries("rec-missing", 0, None).await.unwrap_err().is_not_found());
    }

    /// Story: Raw export writes one file per capture below the export root
    #[tokio::test]
    async fn story_export_raw_writes_one_file_per_capture() {
        let root = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.collector.export_dir = root.path().to_path_buf();
        let cluster = Arc::new(FakeCluster::with_workload(
            app_deployment("orders"),
            app_service("orders", 8080),
        ));
        let manager = SessionManager::new(cluster.clone(), Stores::in_memory(), &config).unwrap();
        let session = manager.start_recording(record_request(None)).await.unwrap();
        cluster.pods.lock().unwrap().push(pod("orders-a", true));
        cluster.add_capture("orders-a", "/var/log/envoy/taps/rec-1.json", capture("/api/orders", 200));

        let summary = manager
            .export_raw(&session.session_id, Some("debug/out"))
            .await
            .unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.directory, root.path().join("debug/out"));
        assert!(summary.directory.join("orders__orders-a__rec-1.json").exists());

        let default = manager.export_raw(&session.session_id, None).await.unwrap();
        assert_eq!(default.directory, root.path().join(&session.session_id));
    }

    /// Story: Export targets outside the export root are rejected before any write
    #[tokio::test]
    async fn story_export_raw_rejects_escaping_directories() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();

        for dir in ["/tmp/elsewhere", "../outside", "a/../../b", "", "./"] {
            assert!(
                matches!(
                    h.manager.export_raw(&session.session_id, Some(dir)).await,
                    Err(Error::Validation(_))
                ),
                "{dir:?} accepted"
            );
        }
    }

    /// Story: Only finished sessions can be deleted, taking their entries along
    #[tokio::test]
    async fn story_delete_requires_terminal_session() {
        let h = harness();
        let session = h.manager.start_recording(record_request(None)).await.unwrap();
        let id = session.session_id.clone();

        assert!(matches!(
            h.manager.delete(&id).await,
            Err(Error::Validation(_))
        ));

        h.manager.stop(&id).await.unwrap();
        h.manager.delete(&id).await.unwrap();
        assert!(h.manager.status(&id).await.unwrap_err().is_not_found());
        assert_eq!(h.stores.entries.count(&id).await.unwrap(), 0);
    }

    // ==========================================================================
    // Story Tests: Startup Recovery
    // ==========================================================================

    /// Story: Persisted sessions get their timers back, expired ones stop
    #[tokio::test]
    async fn story_recover_rearms_and_stops_expired() {
        let h = harness();
        let now = Utc::now();

        let mut live = recording_session("rec-live");
        live.expires_at = Some(now + chrono::Duration::minutes(5));
        let mut expired = recording_session("rec-expired");
        expired.expires_at = Some(now - chrono::Duration::minutes(1));
        let unbounded = recording_session("rec-unbounded");
        for s in [&live, &expired, &unbounded] {
            h.stores.sessions.save(s).await.unwrap();
        }

        let report = h.manager.recover().await.unwrap();

        assert_eq!(report, RecoveryReport { rearmed: 1, stopped: 1 });
        assert!(h.manager.scheduler().is_scheduled("rec-live"));
        assert!(!h.manager.scheduler().is_scheduled("rec-unbounded"));
        assert_eq!(h.stored("rec-expired").await.status, SessionStatus::Stopped);
        h.manager.scheduler().cancel_all();
    }
}
