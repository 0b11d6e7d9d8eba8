use crate::fleet::catalog::CommandId;
use crate::fleet::responses::ResponseId;

/// Caller-supplied description of one remote machine and the catalog
/// commands assigned to it, in execution order.
///
/// `password` and `key_path` may be empty; which one is used is decided
/// against the authentication methods the server offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub address: String,
    pub username: String,
    pub password: String,
    pub key_path: String,
    pub commands: Vec<CommandId>,
}

/// Lifecycle of a host within a run. Only ever advances forward:
/// `Queued → Processing → ProcessingFinished → Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Queued,
    Processing,
    ProcessingFinished,
    Ready,
}

impl HostStatus {
    /// The sole legal successor of each state.
    pub fn next(self) -> Option<HostStatus> {
        match self {
            HostStatus::Queued => Some(HostStatus::Processing),
            HostStatus::Processing => Some(HostStatus::ProcessingFinished),
            HostStatus::ProcessingFinished => Some(HostStatus::Ready),
            HostStatus::Ready => None,
        }
    }
}

/// Terminal per-host outcome of the connect/authenticate phase. Command
/// execution failures do not change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostErrorCode {
    #[default]
    Success,
    FailedToConnect,
    FailureEstablishingSession,
    PasswordAuthFailed,
    KeyAuthFailed,
    NoSupportedAuthMethod,
}

/// One assigned command on one host: the catalog id plus the interned
/// response ids recorded once the command has run. `None` is the unset
/// sentinel; each id field is written at most once, by the owning session
/// driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub command_id: CommandId,
    pub stdout_response_id: Option<ResponseId>,
    pub stderr_response_id: Option<ResponseId>,
}

impl CommandEntry {
    pub fn new(command_id: CommandId) -> Self {
        Self {
            command_id,
            stdout_response_id: None,
            stderr_response_id: None,
        }
    }
}
