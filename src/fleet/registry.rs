use crate::fleet::catalog::{CommandCatalog, CommandId};
use crate::fleet::host::{CommandEntry, HostErrorCode, HostSpec, HostStatus};
use crate::fleet::responses::{ResponseChannel, ResponseId};
use anyhow::{bail, Result};
use std::sync::Mutex;

#[derive(Debug)]
struct HostState {
    address: String,
    username: String,
    password: String,
    key_path: String,
    entries: Vec<CommandEntry>,
    status: HostStatus,
    error: HostErrorCode,
}

/// Everything a session driver needs to process one host, cloned out of the
/// registry at claim time so the lock is never held across network I/O.
#[derive(Debug, Clone)]
pub struct HostJob {
    pub host_index: usize,
    pub address: String,
    pub username: String,
    pub password: String,
    pub key_path: String,
    pub commands: Vec<CommandId>,
}

/// Point-in-time progress of a run: hosts already `Ready`, hosts still
/// `Queued`, and the fleet size. Computed under the registry lock, never
/// blocking on network I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub finished: usize,
    pub pending: usize,
    pub total: usize,
}

/// Per-host rows of the final result view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub address: String,
    pub error: HostErrorCode,
    pub commands: Vec<CommandEntry>,
}

/// Indexed table of every host in a run.
///
/// Identity and credentials are immutable after construction. The mutable
/// bookkeeping (status, error code, response ids) sits behind one coarse
/// lock acquired only for bookkeeping. Exactly one session driver owns a
/// given host index; the lock serializes bookkeeping across drivers and the
/// scheduler, not access to any one host's payload.
#[derive(Debug)]
pub struct HostRegistry {
    hosts: Mutex<Vec<HostState>>,
    total: usize,
}

impl HostRegistry {
    /// Builds the registry from caller input, rejecting command ids outside
    /// the catalog. Host order is preserved; entries are created in the
    /// order the caller listed them.
    pub fn new(hosts: Vec<HostSpec>, catalog: &CommandCatalog) -> Result<Self> {
        if hosts.is_empty() {
            bail!("at least one host is required to start a run");
        }

        let mut states = Vec::with_capacity(hosts.len());
        for spec in hosts {
            if spec.address.trim().is_empty() {
                bail!("host address must not be empty");
            }
            for &command_id in &spec.commands {
                if catalog.get(command_id).is_none() {
                    bail!(
                        "host {} references command id {} outside the catalog (len {})",
                        spec.address,
                        command_id,
                        catalog.len(),
                    );
                }
            }
            states.push(HostState {
                address: spec.address,
                username: spec.username,
                password: spec.password,
                key_path: spec.key_path,
                entries: spec.commands.iter().copied().map(CommandEntry::new).collect(),
                status: HostStatus::Queued,
                error: HostErrorCode::Success,
            });
        }

        let total = states.len();
        Ok(Self {
            hosts: Mutex::new(states),
            total,
        })
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HostState>> {
        // A driver task can only poison this lock by panicking, which the
        // scheduler already isolates; the bookkeeping stays usable.
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scheduler claim: if the host at `index` is still `Queued`, advance it
    /// to `Processing` and hand back its job. Returns `None` when the host
    /// is in any other state.
    pub fn claim_if_queued(&self, index: usize) -> Option<HostJob> {
        let mut hosts = self.lock();
        let host = &mut hosts[index];
        if host.status != HostStatus::Queued {
            return None;
        }
        host.status = HostStatus::Processing;
        Some(HostJob {
            host_index: index,
            address: host.address.clone(),
            username: host.username.clone(),
            password: host.password.clone(),
            key_path: host.key_path.clone(),
            commands: host.entries.iter().map(|entry| entry.command_id).collect(),
        })
    }

    /// Driver handoff: record the terminal error code and advance the host
    /// from `Processing` to `ProcessingFinished`.
    pub fn finish_processing(&self, index: usize, error: HostErrorCode) {
        let mut hosts = self.lock();
        let host = &mut hosts[index];
        debug_assert_eq!(host.status, HostStatus::Processing);
        host.error = error;
        host.status = HostStatus::ProcessingFinished;
    }

    /// Scheduler promotion: advance the host from `ProcessingFinished` to
    /// `Ready`. Returns whether the promotion happened.
    pub fn promote_if_finished(&self, index: usize) -> bool {
        let mut hosts = self.lock();
        let host = &mut hosts[index];
        if host.status != HostStatus::ProcessingFinished {
            return false;
        }
        host.status = HostStatus::Ready;
        true
    }

    pub fn status_of(&self, index: usize) -> HostStatus {
        self.lock()[index].status
    }

    /// Records an interned response id on one command entry. Write-once:
    /// a second write to the same field is ignored and logged.
    pub fn record_response(
        &self,
        index: usize,
        entry_position: usize,
        channel: ResponseChannel,
        id: ResponseId,
    ) {
        let mut hosts = self.lock();
        let entry = &mut hosts[index].entries[entry_position];
        let slot = match channel {
            ResponseChannel::Stdout => &mut entry.stdout_response_id,
            ResponseChannel::Stderr => &mut entry.stderr_response_id,
        };
        if slot.is_some() {
            tracing::warn!(
                host = index,
                entry = entry_position,
                ?channel,
                "response id already recorded; keeping the first write"
            );
            return;
        }
        *slot = Some(id);
    }

    /// Read-only progress scan. Hosts still `Queued` count as pending,
    /// hosts in `Ready` count as finished; everything in between is in
    /// flight.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let hosts = self.lock();
        let mut snapshot = StatusSnapshot {
            finished: 0,
            pending: 0,
            total: self.total,
        };
        for host in hosts.iter() {
            match host.status {
                HostStatus::Queued => snapshot.pending += 1,
                HostStatus::Ready => snapshot.finished += 1,
                HostStatus::Processing | HostStatus::ProcessingFinished => {}
            }
        }
        snapshot
    }

    /// True once every host has reached `Ready`.
    pub fn is_complete(&self) -> bool {
        self.lock().iter().all(|host| host.status == HostStatus::Ready)
    }

    /// Per-host rows for the final result view.
    pub fn report_rows(&self) -> Vec<HostReport> {
        self.lock()
            .iter()
            .map(|host| HostReport {
                address: host.address.clone(),
                error: host.error,
                commands: host.entries.clone(),
            })
            .collect()
    }
}
