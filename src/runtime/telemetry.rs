use crate::fleet::registry::HostRegistry;
use crate::fleet::responses::ResponseStore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls
/// back to `info`. Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    sessions_launched: AtomicU64,
    hosts_completed: AtomicU64,
    connect_failures: AtomicU64,
    auth_failures: AtomicU64,
    commands_executed: AtomicU64,
    responses_interned: AtomicU64,
    readiness_stalls: AtomicU64,
    active_sessions: AtomicUsize,
}

impl Telemetry {
    pub fn record_session_launched(&self) {
        self.sessions_launched.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_host_completed(&self) {
        self.hosts_completed.fetch_add(1, Ordering::Relaxed);
        // The gauge mirrors the scheduler's active count; completion always
        // follows a launch.
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_interned(&self) {
        self.responses_interned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_readiness_stall(&self) {
        self.readiness_stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn sessions_launched(&self) -> u64 {
        self.sessions_launched.load(Ordering::Relaxed)
    }

    pub fn hosts_completed(&self) -> u64 {
        self.hosts_completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            sessions_launched: self.sessions_launched.load(Ordering::Relaxed),
            hosts_completed: self.hosts_completed.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            responses_interned: self.responses_interned.load(Ordering::Relaxed),
            readiness_stalls: self.readiness_stalls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub sessions_launched: u64,
    pub hosts_completed: u64,
    pub connect_failures: u64,
    pub auth_failures: u64,
    pub commands_executed: u64,
    pub responses_interned: u64,
    pub readiness_stalls: u64,
}

/// Spawns a background task that periodically logs fleet progress, session
/// counters, and response-store size.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    registry: Arc<HostRegistry>,
    store: Arc<ResponseStore>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "sshfleet::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = telemetry.snapshot();
                    let progress = registry.status_snapshot();

                    tracing::info!(
                        target: "sshfleet::metrics",
                        finished_hosts = progress.finished,
                        pending_hosts = progress.pending,
                        total_hosts = progress.total,
                        active_sessions = telemetry.active_sessions(),
                        commands_executed = snapshot.commands_executed,
                        responses_interned = snapshot.responses_interned,
                        store_entries = store.len(),
                        connect_failures = snapshot.connect_failures,
                        auth_failures = snapshot.auth_failures,
                        readiness_stalls = snapshot.readiness_stalls,
                        "runtime metrics snapshot"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::catalog::CommandCatalog;
    use crate::fleet::host::HostSpec;
    use crate::fleet::responses::ResponseChannel;
    use tokio::time::timeout;

    #[test]
    fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_session_launched();
        telemetry.record_session_launched();
        assert_eq!(telemetry.active_sessions(), 2);

        telemetry.record_host_completed();
        telemetry.record_connect_failure();
        telemetry.record_auth_failure();
        telemetry.record_command_executed();
        telemetry.record_response_interned();
        telemetry.record_readiness_stall();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.sessions_launched, 2);
        assert_eq!(snapshot.hosts_completed, 1);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.commands_executed, 1);
        assert_eq!(snapshot.responses_interned, 1);
        assert_eq!(snapshot.readiness_stalls, 1);
        assert_eq!(telemetry.active_sessions(), 1);
    }

    #[tokio::test]
    async fn metrics_reporter_logs_until_shutdown() {
        let catalog = CommandCatalog::new(vec!["true".to_owned()]);
        let registry = Arc::new(
            HostRegistry::new(
                vec![HostSpec {
                    address: "a.example".to_owned(),
                    username: "ops".to_owned(),
                    password: "pw".to_owned(),
                    key_path: String::new(),
                    commands: vec![0],
                }],
                &catalog,
            )
            .expect("registry builds"),
        );
        let store = Arc::new(ResponseStore::new());
        store.intern("hi\n".to_owned(), ResponseChannel::Stdout);

        let shutdown = CancellationToken::new();
        let handle = spawn_metrics_reporter(
            Arc::new(Telemetry::default()),
            registry,
            store,
            shutdown.clone(),
            Duration::from_millis(10),
        );

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
