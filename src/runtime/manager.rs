use crate::fleet::catalog::CommandCatalog;
use crate::fleet::host::HostSpec;
use crate::fleet::registry::{HostReport, HostRegistry, StatusSnapshot};
use crate::fleet::responses::{ResponseChannel, ResponseStore};
use crate::runtime::config::FleetConfig;
use crate::runtime::telemetry::{self, Telemetry};
use crate::scheduler::pool::{run_scheduler, SchedulerParams};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Opaque identifier of one started run. Generated, never a reinterpreted
/// pointer; looked up in the manager's run table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Final result view of a completed run: per-host rows plus the drained
/// response store, in id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub hosts: Vec<HostReport>,
    pub responses: Vec<(String, ResponseChannel)>,
}

struct RunEntry {
    registry: Arc<HostRegistry>,
    store: Arc<ResponseStore>,
    done_rx: watch::Receiver<bool>,
}

/// The engine's external surface: starts runs, reports their progress, and
/// hands out their results.
///
/// One manager can carry any number of concurrent runs; each run bundles
/// its own host registry, command catalog, and response store, with its
/// scheduler and sessions cancelled through a child of the manager's root
/// token.
pub struct FleetManager {
    config: FleetConfig,
    telemetry: Arc<Telemetry>,
    runs: Mutex<HashMap<RunId, RunEntry>>,
    next_run: AtomicU64,
    shutdown: CancellationToken,
}

impl FleetManager {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            telemetry: Arc::new(Telemetry::default()),
            runs: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Returns a clone of the root shutdown token so callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Validates the fleet against the catalog, builds the run, spawns its
    /// scheduler, and returns the opaque run id. Must be called inside a
    /// tokio runtime.
    pub fn start(&self, hosts: Vec<HostSpec>, commands: Vec<String>) -> Result<RunId> {
        let catalog = Arc::new(CommandCatalog::new(commands));
        let registry = Arc::new(HostRegistry::new(hosts, &catalog)?);
        let store = Arc::new(ResponseStore::new());

        let run_id = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let run_token = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        // Detached on purpose: the reporter exits when the run token is
        // cancelled at the end of the run.
        let _reporter = telemetry::spawn_metrics_reporter(
            self.telemetry.clone(),
            registry.clone(),
            store.clone(),
            run_token.clone(),
            self.config.metrics_interval(),
        );

        let params = SchedulerParams {
            registry: registry.clone(),
            catalog,
            store: store.clone(),
            config: self.config.clone(),
            telemetry: self.telemetry.clone(),
            cancel: run_token.clone(),
        };
        tokio::spawn(async move {
            run_scheduler(params).await;
            run_token.cancel();
            let _ = done_tx.send(true);
        });

        tracing::info!(%run_id, hosts = registry.len(), "run started");
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                run_id,
                RunEntry {
                    registry,
                    store,
                    done_rx,
                },
            );
        Ok(run_id)
    }

    /// Point-in-time progress of a run. Safe to call at any time,
    /// concurrently with the scheduler; never blocks on network I/O.
    pub fn status(&self, run: RunId) -> Result<StatusSnapshot> {
        let runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = runs
            .get(&run)
            .with_context(|| format!("unknown run handle {run}"))?;
        Ok(entry.registry.status_snapshot())
    }

    /// Waits until the run's scheduler has finished (every host `Ready`,
    /// or the run cancelled and drained).
    pub async fn join(&self, run: RunId) -> Result<()> {
        let mut done_rx = {
            let runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            runs.get(&run)
                .with_context(|| format!("unknown run handle {run}"))?
                .done_rx
                .clone()
        };
        loop {
            if *done_rx.borrow_and_update() {
                return Ok(());
            }
            done_rx
                .changed()
                .await
                .context("scheduler task ended without signalling completion")?;
        }
    }

    /// Collects the result of a completed run and drains its response
    /// store. Consume-once: calling before completion is a usage error,
    /// and a second call observes an empty store.
    pub fn result(&self, run: RunId) -> Result<RunReport> {
        let runs = self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = runs
            .get(&run)
            .with_context(|| format!("unknown run handle {run}"))?;
        if !entry.registry.is_complete() {
            bail!("{run} has not finished; poll status or join before collecting the result");
        }
        Ok(RunReport {
            hosts: entry.registry.report_rows(),
            responses: entry.store.drain(),
        })
    }

    /// Cancels the root token: schedulers stop launching sessions, active
    /// drivers abort at their next readiness-wait point and drain, and
    /// in-flight runs are abandoned rather than completed.
    pub fn shutdown(&self) {
        tracing::info!("fleet manager shutting down");
        self.shutdown.cancel();
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(address: &str, commands: Vec<usize>) -> HostSpec {
        HostSpec {
            address: address.to_owned(),
            username: "ops".to_owned(),
            password: "pw".to_owned(),
            key_path: String::new(),
            commands,
        }
    }

    #[tokio::test]
    async fn start_rejects_invalid_input() {
        let manager = FleetManager::new(FleetConfig::default());
        assert!(manager.start(Vec::new(), vec!["true".to_owned()]).is_err());
        assert!(manager
            .start(vec![host("a.example", vec![1])], vec!["true".to_owned()])
            .is_err());
    }

    #[tokio::test]
    async fn unknown_run_handles_are_rejected() {
        let manager = FleetManager::new(FleetConfig::default());
        let bogus = RunId(999);
        assert!(manager.status(bogus).is_err());
        assert!(manager.result(bogus).is_err());
        assert!(manager.join(bogus).await.is_err());
    }

    #[tokio::test]
    async fn result_before_completion_is_a_usage_error() {
        let config = FleetConfig::builder()
            .connect_timeout(std::time::Duration::from_millis(500))
            .build()
            .expect("test config is valid");
        let manager = FleetManager::new(config);

        // A listener that never speaks SSH: the driver stays stuck in the
        // handshake until its timeout, so the run cannot be complete when
        // result() is first called.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let address = listener.local_addr().expect("listener address").to_string();

        let run = manager
            .start(vec![host(&address, vec![0])], vec!["true".to_owned()])
            .expect("run starts");
        let err = manager.result(run).expect_err("run cannot be complete yet");
        assert!(err.to_string().contains("has not finished"));

        manager.join(run).await.expect("run completes");
        let report = manager.result(run).expect("result after completion");
        assert_eq!(report.hosts.len(), 1);
        assert!(report.responses.is_empty());
    }
}
