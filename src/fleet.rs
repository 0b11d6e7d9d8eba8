//! Fleet data model: the command catalog, the host registry with its
//! lifecycle bookkeeping, and the deduplicating response store.

pub mod catalog;
pub mod host;
pub mod registry;
pub mod responses;

pub use catalog::{CommandCatalog, CommandId};
pub use host::{CommandEntry, HostErrorCode, HostSpec, HostStatus};
pub use registry::{HostReport, HostRegistry, StatusSnapshot};
pub use responses::{ResponseChannel, ResponseId, ResponseStore};
