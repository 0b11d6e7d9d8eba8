//! Concurrent SSH fleet command execution.
//!
//! A caller hands [`FleetManager::start`] a fleet of hosts (credentials
//! plus an ordered list of command ids) and a command catalog. The
//! scheduler launches one session driver per eligible host up to a
//! concurrency ceiling; each driver authenticates, runs its host's
//! commands strictly in order, and interns captured output into a shared
//! deduplicating response store. Progress is polled through
//! [`FleetManager::status`]; the aggregated result (per-host command
//! rows plus the drained store) is collected once with
//! [`FleetManager::result`].

pub mod fleet;
pub mod runtime;
mod scheduler;
mod session;

pub use fleet::catalog::{CommandCatalog, CommandId};
pub use fleet::host::{CommandEntry, HostErrorCode, HostSpec, HostStatus};
pub use fleet::registry::{HostReport, HostRegistry, StatusSnapshot};
pub use fleet::responses::{ResponseChannel, ResponseId, ResponseStore};
pub use runtime::config::{FleetConfig, FleetConfigBuilder, FleetConfigParams};
pub use runtime::manager::{FleetManager, RunId, RunReport};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
