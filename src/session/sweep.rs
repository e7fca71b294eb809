//! Periodic background work: harvesting live sessions and tearing down
//! cluster state whose session record is gone

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionManager;
use crate::sidecar::ConfigOwner;
use crate::Result;

/// Run the sweeps every `auto_collect_interval` until `shutdown` fires
pub fn spawn_sweeps(manager: SessionManager, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = manager
        .settings()
        .auto_collect_interval()
        .max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Background sweeps stopped");
                    break;
                }
                _ = ticker.tick() => {
                    manager.auto_collect().await;
                    if manager.settings().reconcile_orphans {
                        if let Err(e) = manager.reconcile_orphans().await {
                            warn!(error = %e, "Orphan reconciliation failed");
                        }
                    }
                }
            }
        }
    })
}

impl SessionManager {
    /// Harvest every RECORDING session older than `auto_collect_min_age`
    pub async fn auto_collect(&self) -> usize {
        let sessions = match self.inner.stores.sessions.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to list active sessions");
                return 0;
            }
        };

        let min_age = chrono::Duration::from_std(self.inner.settings.auto_collect_min_age())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        let due: Vec<_> = sessions
            .into_iter()
            .filter(|s| s.tap_enabled && now - s.started_at >= min_age)
            .collect();
        if due.is_empty() {
            return 0;
        }

        let results = join_all(due.iter().map(|s| self.inner.collector.harvest(s))).await;
        let mut total = 0;
        for (session, result) in due.iter().zip(results) {
            match result {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Background harvest failed")
                }
            }
        }
        debug!(sessions = due.len(), entries = total, "Background harvest done");
        total
    }

    /// Tear down config objects (and the redirect/sidecar they imply) whose
    /// session record is missing or terminal; returns how many were cleaned
    ///
    /// Workloads that another active session now targets keep their port
    /// and sidecar; only the stale config object goes.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        let sidecar = &self.inner.sidecar;
        let configs = sidecar.list_managed_configs().await?;
        let active = self.inner.stores.sessions.list_active().await?;
        let mut cleaned = 0;

        for cm in configs {
            let (Some(namespace), Some(name)) =
                (cm.metadata.namespace.clone(), cm.metadata.name.clone())
            else {
                continue;
            };
            let Some(owner) = ConfigOwner::from_config_map(&cm) else {
                warn!(namespace = %namespace, name = %name, "Managed config object without ownership annotations");
                continue;
            };

            match self.inner.stores.sessions.load(&owner.session_id).await {
                Ok(Some(session)) if !session.status.is_terminal() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(session_id = %owner.session_id, error = %e, "Cannot read session, leaving its config object");
                    continue;
                }
            }

            warn!(
                session_id = %owner.session_id,
                namespace = %namespace,
                service = %owner.service,
                deployment = %owner.deployment,
                "Tearing down orphaned session state"
            );

            let service_taken = active
                .iter()
                .any(|s| s.namespace == namespace && s.service_name == owner.service);
            if !service_taken {
                if let Err(e) = sidecar
                    .redirect_traffic(&namespace, &owner.service, owner.original_port)
                    .await
                {
                    warn!(namespace = %namespace, service = %owner.service, error = %e, "Failed to restore orphaned service");
                }
            }

            let deployment_taken = active
                .iter()
                .any(|s| s.namespace == namespace && s.deployment_name == owner.deployment);
            if !deployment_taken {
                if let Err(e) = sidecar.remove_sidecar(&namespace, &owner.deployment).await {
                    warn!(namespace = %namespace, deployment = %owner.deployment, error = %e, "Failed to remove orphaned sidecar");
                }
            }

            if let Err(e) = sidecar.delete_config(&namespace, &name).await {
                warn!(namespace = %namespace, name = %name, error = %e, "Failed to delete orphaned config object");
                continue;
            }
            cleaned += 1;
        }

        if cleaned > 0 {
            info!(cleaned, "Reconciled orphaned sessions");
        }
        Ok(cleaned)
    }
}
