use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use svclb_common::{BackendId, BackendValueV4, ServiceKeyV4, ServiceValueV4};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};
use crate::bpf::BpfMap;
use crate::bpf::service::ServiceBackendState;
use crate::metrics::SyncMetrics;
use crate::services::{self, DesiredState};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

/// Applies desired states to the maps, writing only what changed since the
/// last successful apply.
pub struct Syncer<S, B>
where
    S: BpfMap<ServiceKeyV4, ServiceValueV4>,
    B: BpfMap<BackendId, BackendValueV4>,
{
    state: ServiceBackendState<S, B>,
    applied: DesiredState,
    metrics: SyncMetrics,
}

impl<S, B> Syncer<S, B>
where
    S: BpfMap<ServiceKeyV4, ServiceValueV4>,
    B: BpfMap<BackendId, BackendValueV4>,
{
    pub fn new(state: ServiceBackendState<S, B>, metrics: SyncMetrics) -> Self {
        Self {
            state,
            applied: DesiredState::default(),
            metrics,
        }
    }

    pub fn state(&self) -> &ServiceBackendState<S, B> {
        &self.state
    }

    /// Removals go first so a frontend that moved between services never
    /// sees two owners. A frontend whose write fails is logged and retried on
    /// the next apply while every other frontend is still applied; the
    /// failures are returned together at the end.
    pub fn apply(&mut self, desired: DesiredState) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut failed = 0;
        let mut first_error = None;

        // frontends whose last update failed were never applied but may
        // still hold map entries
        let stale: Vec<ServiceKeyV4> = self
            .state
            .frontends()
            .filter(|k| !desired.contains_key(k))
            .copied()
            .collect();
        for key in stale {
            let frontend = format!("{}:{}", key.ip(), key.port());
            let result = self.state.remove(&key);
            self.metrics.write("remove", result.is_ok());
            match result {
                Ok(_) => {
                    let service = self.applied.remove(&key).map(|s| s.name);
                    info!(
                        service = service.as_deref().unwrap_or("-"),
                        %frontend,
                        "removed service"
                    );
                    report.removed += 1;
                }
                Err(e) => {
                    error!(%e, %frontend, "failed to remove service");
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        for (key, service) in desired {
            if self.applied.get(&key) == Some(&service) {
                report.unchanged += 1;
                continue;
            }
            let frontend = format!("{}:{}", key.ip(), key.port());
            let result = self.state.update(key, service.extra, &service.backends);
            self.metrics.write("update", result.is_ok());
            match result {
                Ok(rev_nat_index) => {
                    info!(
                        service = %service.name,
                        %frontend,
                        backends = service.backends.len(),
                        rev_nat_index,
                        "programmed service"
                    );
                    self.applied.insert(key, service);
                    report.updated += 1;
                }
                Err(e) => {
                    error!(%e, service = %service.name, %frontend, "failed to program service");
                    self.applied.remove(&key);
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        self.metrics
            .frontends
            .set(i64::try_from(self.state.frontend_count()).unwrap_or(i64::MAX));
        self.metrics
            .backends
            .set(i64::try_from(self.state.backend_count()).unwrap_or(i64::MAX));
        match first_error {
            None => Ok(report),
            Some(first) => Err(Error::PartialSync {
                failed,
                first: Box::new(first),
            }),
        }
    }

    pub fn sync_file(&mut self, path: &Path) -> Result<SyncReport> {
        let file = services::load(path)?;
        self.apply(services::desired_state(&file))
    }
}

/// Syncs `path` every `interval` until `cancel` fires. `ready` is cancelled
/// once the first sync succeeded.
pub async fn run<S, B>(
    mut syncer: Syncer<S, B>,
    path: PathBuf,
    interval: Duration,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()>
where
    S: BpfMap<ServiceKeyV4, ServiceValueV4>,
    B: BpfMap<BackendId, BackendValueV4>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stopping service sync");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let start = Instant::now();
        syncer.metrics.runs.inc();
        match syncer.sync_file(&path) {
            Ok(report) => {
                if report.updated + report.removed > 0 {
                    info!(
                        updated = report.updated,
                        removed = report.removed,
                        unchanged = report.unchanged,
                        "synced services"
                    );
                } else {
                    debug!(unchanged = report.unchanged, "services unchanged");
                }
                if !ready.is_cancelled() {
                    // leftovers of a previous run in the pinned maps
                    match syncer.state.prune_unmanaged() {
                        Ok((0, 0)) => {}
                        Ok((services, backends)) => {
                            info!(services, backends, "pruned stale map entries")
                        }
                        Err(e) => warn!(%e, "failed to prune stale map entries"),
                    }
                    info!("initial service sync complete");
                    ready.cancel();
                }
            }
            Err(e) => {
                syncer.metrics.failure(&e);
                error!(%e, path = %path.display(), "failed to sync services, keeping previous state");
            }
        }
        syncer
            .metrics
            .duration
            .observe(start.elapsed().as_secs_f64());
    }
}
