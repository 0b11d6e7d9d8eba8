//! The cooperative polling scheduler.
//!
//! A circular scan over the host registry launches one session driver per
//! eligible host up to the concurrency ceiling and promotes finished hosts
//! to `Ready`. The registry lock is taken for bookkeeping only, never
//! while any session is doing network I/O, and the loop yields a short
//! fixed delay between scan steps instead of busy-spinning; the dominant
//! latency is network round-trips per host, not scheduler overhead.

use crate::fleet::catalog::CommandCatalog;
use crate::fleet::host::{HostErrorCode, HostStatus};
use crate::fleet::registry::{HostJob, HostRegistry};
use crate::fleet::responses::ResponseStore;
use crate::runtime::config::FleetConfig;
use crate::runtime::telemetry::Telemetry;
use crate::session::driver::SessionDriver;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;

pub(crate) struct SchedulerParams {
    pub registry: Arc<HostRegistry>,
    pub catalog: Arc<CommandCatalog>,
    pub store: Arc<ResponseStore>,
    pub config: FleetConfig,
    pub telemetry: Arc<Telemetry>,
    pub cancel: CancellationToken,
}

/// Runs the scan loop until every host has reached `Ready`, or, after
/// cancellation, until the already-launched drivers have drained.
/// A driver failure is captured as its host's error code and never
/// propagates as a scheduler fault.
pub(crate) async fn run_scheduler(params: SchedulerParams) {
    let SchedulerParams {
        registry,
        catalog,
        store,
        config,
        telemetry,
        cancel,
    } = params;

    let total = registry.len();
    let ceiling = config.max_active_sessions();
    let mut cursor = 0usize;
    let mut active = 0usize;
    let mut processed = 0usize;

    tracing::info!(hosts = total, ceiling, "scheduler started");

    loop {
        if cancel.is_cancelled() && active == 0 {
            tracing::info!(
                processed,
                total,
                "scheduler cancelled; abandoning hosts still queued"
            );
            return;
        }

        match registry.status_of(cursor) {
            HostStatus::Queued if active < ceiling && !cancel.is_cancelled() => {
                if let Some(job) = registry.claim_if_queued(cursor) {
                    tracing::debug!(host = %job.address, "found queued host to process");
                    active += 1;
                    telemetry.record_session_launched();
                    launch_driver(LaunchParams {
                        job,
                        registry: registry.clone(),
                        catalog: catalog.clone(),
                        store: store.clone(),
                        telemetry: telemetry.clone(),
                        config: config.clone(),
                        cancel: cancel.child_token(),
                    });
                }
            }
            HostStatus::ProcessingFinished => {
                if registry.promote_if_finished(cursor) {
                    active -= 1;
                    processed += 1;
                    telemetry.record_host_completed();
                    tracing::debug!(host = cursor, "finished processing host");
                }
            }
            _ => {}
        }

        if processed == total {
            tracing::info!(total, "scheduler finished; all hosts ready");
            return;
        }

        cursor = (cursor + 1) % total;
        time::sleep(config.poll_interval()).await;
    }
}

struct LaunchParams {
    job: HostJob,
    registry: Arc<HostRegistry>,
    catalog: Arc<CommandCatalog>,
    store: Arc<ResponseStore>,
    telemetry: Arc<Telemetry>,
    config: FleetConfig,
    cancel: CancellationToken,
}

/// Spawns one panic-isolated session driver. Whatever happens inside the
/// driver, the host completes its lifecycle: the wrapper records the
/// terminal error code and advances the host to `ProcessingFinished`.
fn launch_driver(params: LaunchParams) {
    let LaunchParams {
        job,
        registry,
        catalog,
        store,
        telemetry,
        config,
        cancel,
    } = params;

    let host_index = job.host_index;
    let address = job.address.clone();
    let driver = SessionDriver::new(job, catalog, registry.clone(), store, telemetry, config, cancel);

    tokio::spawn(async move {
        let outcome = std::panic::AssertUnwindSafe(driver.run()).catch_unwind().await;
        let error_code = match outcome {
            Ok(code) => code,
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(
                    host = %address,
                    panic = %panic_msg,
                    "session driver panicked"
                );
                // The error taxonomy has no slot for an internal fault; the
                // host still completes its lifecycle.
                HostErrorCode::Success
            }
        };
        registry.finish_processing(host_index, error_code);
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
