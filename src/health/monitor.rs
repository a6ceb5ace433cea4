//! Periodic monitor keeping every server's role, lag and health current.
//!
//! Each server gets one long-running task holding a persistent link. The
//! routing path only ever reads the results through `Server` accessors.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendLink;
use crate::config::{BackendConfig, HealthCheckConfig};
use crate::metrics::metrics;

use super::probe::{ProbeResult, ServerProbe};
use super::server::{ConnectionSlot, Server, ServerDirectory};

pub struct Monitor {
    directory: Arc<ServerDirectory>,
    config: HealthCheckConfig,
    credentials: BackendConfig,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(
        directory: Arc<ServerDirectory>,
        config: HealthCheckConfig,
        credentials: BackendConfig,
    ) -> Self {
        Self {
            directory,
            config,
            credentials,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn one check task per server. Tasks stop when the monitor is dropped.
    pub fn start(&self) {
        if !self.config.enabled {
            info!("Health monitor disabled, using configured roles");
            return;
        }
        for server in self.directory.servers() {
            self.spawn_check_task(server.clone());
        }
    }

    fn spawn_check_task(&self, server: Arc<Server>) {
        let cancel = self.cancel.clone();
        let credentials = self.credentials.clone();
        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        let timeout = Duration::from_millis(self.config.check_timeout_ms);

        tokio::spawn(async move {
            // Stagger the first check across the interval
            let initial_delay = rand::thread_rng().gen_range(0..interval.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(initial_delay)).await;

            let mut link: Option<(BackendLink, ConnectionSlot)> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(server = %server.name(), "Monitor task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::check(&server, &credentials, &mut link, timeout).await;
                    }
                }
            }
        });

        debug!("Spawned monitor task");
    }

    async fn check(
        server: &Arc<Server>,
        credentials: &BackendConfig,
        link: &mut Option<(BackendLink, ConnectionSlot)>,
        timeout: Duration,
    ) {
        let result = tokio::time::timeout(timeout, Self::probe(server, credentials, link)).await;

        let outcome = match result {
            Ok(Ok(probe)) => {
                metrics().record_health_check("success");
                Some((probe.role, probe.replication_lag))
            }
            Ok(Err(e)) => {
                *link = None;
                metrics().record_health_check("failure");
                debug!(server = %server.name(), error = %e, "Health check failed");
                None
            }
            Err(_) => {
                *link = None;
                metrics().record_health_check("timeout");
                debug!(server = %server.name(), "Health check timed out");
                None
            }
        };

        let available = outcome.is_some();
        if server.record_check(outcome) {
            let status = server.health_status();
            if available {
                info!(server = %server.name(), role = server.role().as_str(), status = status.as_str(), "Server status changed");
            } else {
                warn!(server = %server.name(), status = status.as_str(), "Server status changed");
            }
        }
    }

    /// Probe over the cached link, reconnecting once if it went stale
    async fn probe(
        server: &Arc<Server>,
        credentials: &BackendConfig,
        link: &mut Option<(BackendLink, ConnectionSlot)>,
    ) -> Result<ProbeResult, String> {
        if let Some((ref mut cached, _)) = link {
            match ServerProbe::probe(cached).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(server = %server.name(), error = %e, "Cached monitor link failed, reconnecting");
                    *link = None;
                }
            }
        }

        let mut fresh = BackendLink::connect(server, credentials, None)
            .await
            .map_err(|e| e.to_string())?;
        let slot = ConnectionSlot::monitor(server.clone());
        let result = ServerProbe::probe(&mut fresh).await.map_err(|e| e.to_string())?;
        *link = Some((fresh, slot));
        Ok(result)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
