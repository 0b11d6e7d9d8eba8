use crate::fleet::catalog::CommandCatalog;
use crate::fleet::host::HostErrorCode;
use crate::fleet::registry::{HostJob, HostRegistry};
use crate::fleet::responses::{ResponseChannel, ResponseStore};
use crate::runtime::config::FleetConfig;
use crate::runtime::telemetry::Telemetry;
use crate::session::transport::{self, FleetClientHandler, ReadyWait};
use anyhow::{anyhow, bail, Context, Error as AnyError, Result};
use russh::client::{self, AuthResult, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, MethodKind};
use std::fmt;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Exit code reported for a command whose channel close was never
/// confirmed by the server. A sentinel only; it carries no meaning beyond
/// "close not confirmed".
pub(crate) const EXIT_CODE_CLOSE_UNCONFIRMED: u32 = 127;

/// Terminal failure of the connect/authenticate phase, mapping one-to-one
/// onto the host error taxonomy.
#[derive(Debug)]
pub(crate) enum SessionFailure {
    Connect(AnyError),
    Handshake(AnyError),
    PasswordAuth(AnyError),
    KeyAuth(AnyError),
    NoSupportedAuthMethod,
}

impl SessionFailure {
    pub(crate) fn error_code(&self) -> HostErrorCode {
        match self {
            SessionFailure::Connect(_) => HostErrorCode::FailedToConnect,
            SessionFailure::Handshake(_) => HostErrorCode::FailureEstablishingSession,
            SessionFailure::PasswordAuth(_) => HostErrorCode::PasswordAuthFailed,
            SessionFailure::KeyAuth(_) => HostErrorCode::KeyAuthFailed,
            SessionFailure::NoSupportedAuthMethod => HostErrorCode::NoSupportedAuthMethod,
        }
    }

    fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SessionFailure::PasswordAuth(_)
                | SessionFailure::KeyAuth(_)
                | SessionFailure::NoSupportedAuthMethod
        )
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::Connect(err) => write!(f, "failed to connect to host: {err}"),
            SessionFailure::Handshake(err) => {
                write!(f, "failure establishing session: {err}")
            }
            SessionFailure::PasswordAuth(err) => {
                write!(f, "authentication by password failed: {err}")
            }
            SessionFailure::KeyAuth(err) => {
                write!(f, "authentication by public key failed: {err}")
            }
            SessionFailure::NoSupportedAuthMethod => {
                write!(f, "no supported authentication methods found")
            }
        }
    }
}

impl std::error::Error for SessionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionFailure::Connect(err)
            | SessionFailure::Handshake(err)
            | SessionFailure::PasswordAuth(err)
            | SessionFailure::KeyAuth(err) => Some(err.as_ref()),
            SessionFailure::NoSupportedAuthMethod => None,
        }
    }
}

struct CommandOutput {
    stdout: String,
    stderr: String,
}

/// Per-host state machine: connect, authenticate, run each assigned
/// command strictly in order, record interned output, disconnect.
///
/// All side effects stay confined to the owning host's command entries and
/// to response-store interning; no other host's data is touched.
pub(crate) struct SessionDriver {
    job: HostJob,
    catalog: Arc<CommandCatalog>,
    registry: Arc<HostRegistry>,
    store: Arc<ResponseStore>,
    telemetry: Arc<Telemetry>,
    config: FleetConfig,
    waits: ReadyWait,
}

impl SessionDriver {
    pub(crate) fn new(
        job: HostJob,
        catalog: Arc<CommandCatalog>,
        registry: Arc<HostRegistry>,
        store: Arc<ResponseStore>,
        telemetry: Arc<Telemetry>,
        config: FleetConfig,
        cancel: CancellationToken,
    ) -> Self {
        let waits = ReadyWait::new(&config, cancel, telemetry.clone());
        Self {
            job,
            catalog,
            registry,
            store,
            telemetry,
            config,
            waits,
        }
    }

    /// Runs the session to completion and returns the host's terminal
    /// error code. Command-phase failures abort the remaining commands but
    /// do not change the error code; output already recorded is kept.
    #[tracing::instrument(name = "session", skip_all, fields(host = %self.job.address))]
    pub(crate) async fn run(self) -> HostErrorCode {
        tracing::info!("processing host");

        let mut handle = match self.open_session().await {
            Ok(handle) => handle,
            Err(failure) => {
                if failure.is_auth_failure() {
                    self.telemetry.record_auth_failure();
                } else {
                    self.telemetry.record_connect_failure();
                }
                tracing::warn!(error = %failure, "session setup failed");
                return failure.error_code();
            }
        };

        if let Err(err) = self.execute_commands(&mut handle).await {
            tracing::warn!(
                error = %err,
                "command execution aborted; output already recorded is kept"
            );
        }

        self.disconnect(&handle).await;
        HostErrorCode::Success
    }

    /// Connect, handshake, and authenticate. On an authentication-phase
    /// failure the session is disconnected cleanly before returning.
    async fn open_session(&self) -> Result<Handle<FleetClientHandler>, SessionFailure> {
        let (host, port) = transport::split_address(&self.job.address, self.config.ssh_port());

        let stream = transport::open_transport(&host, port, self.config.connect_timeout())
            .await
            .map_err(SessionFailure::Connect)?;

        // The protocol-level timeout is disabled for command execution, so
        // the handshake gets its own ceiling; a silent peer would otherwise
        // hang the session forever.
        let mut handle = time::timeout(
            self.config.connect_timeout(),
            client::connect_stream(transport::client_config(), stream, FleetClientHandler),
        )
        .await
        .map_err(|_| SessionFailure::Handshake(anyhow!("ssh handshake timed out")))?
        .map_err(|err| SessionFailure::Handshake(err.into()))?;

        if let Err(failure) = self.authenticate(&mut handle).await {
            if failure.is_auth_failure() {
                self.disconnect(&handle).await;
            }
            return Err(failure);
        }

        Ok(handle)
    }

    /// Queries the methods the server offers and authenticates with the
    /// preferred applicable one: password when offered and a non-empty
    /// password was supplied, otherwise public key when offered and a
    /// non-empty key path was supplied.
    async fn authenticate(
        &self,
        handle: &mut Handle<FleetClientHandler>,
    ) -> Result<(), SessionFailure> {
        let probe = self
            .waits
            .drive(
                "authentication method probe",
                handle.authenticate_none(self.job.username.clone()),
            )
            .await
            .and_then(|outcome| outcome.map_err(AnyError::from))
            .map_err(SessionFailure::Handshake)?;

        let offered = match probe {
            AuthResult::Success => {
                tracing::debug!("server accepted the authentication probe outright");
                return Ok(());
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => remaining_methods,
        };
        tracing::debug!(methods = ?offered, "authentication methods offered by server");

        let use_password =
            transport::offers(&offered, MethodKind::Password) && !self.job.password.is_empty();
        let use_key =
            transport::offers(&offered, MethodKind::PublicKey) && !self.job.key_path.is_empty();

        if use_password {
            let outcome = self
                .waits
                .drive(
                    "password authentication",
                    handle.authenticate_password(
                        self.job.username.clone(),
                        self.job.password.clone(),
                    ),
                )
                .await
                .and_then(|outcome| outcome.map_err(AnyError::from))
                .map_err(SessionFailure::PasswordAuth)?;
            if !matches!(outcome, AuthResult::Success) {
                return Err(SessionFailure::PasswordAuth(anyhow!(
                    "server rejected the password for user {}",
                    self.job.username,
                )));
            }
            tracing::debug!("authentication by password succeeded");
        } else if use_key {
            let key = load_secret_key(&self.job.key_path, None)
                .with_context(|| format!("failed to load private key from {}", self.job.key_path))
                .map_err(SessionFailure::KeyAuth)?;
            let rsa_hash = self
                .waits
                .drive("signature algorithm negotiation", handle.best_supported_rsa_hash())
                .await
                .and_then(|outcome| outcome.map_err(AnyError::from))
                .map_err(SessionFailure::KeyAuth)?
                .flatten();
            let outcome = self
                .waits
                .drive(
                    "public key authentication",
                    handle.authenticate_publickey(
                        self.job.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
                    ),
                )
                .await
                .and_then(|outcome| outcome.map_err(AnyError::from))
                .map_err(SessionFailure::KeyAuth)?;
            if !matches!(outcome, AuthResult::Success) {
                return Err(SessionFailure::KeyAuth(anyhow!(
                    "server rejected the key for user {}",
                    self.job.username,
                )));
            }
            tracing::debug!("authentication by public key succeeded");
        } else {
            return Err(SessionFailure::NoSupportedAuthMethod);
        }

        Ok(())
    }

    /// Executes the host's commands strictly in list order. A hard failure
    /// aborts the remaining commands; ids already recorded stay recorded.
    async fn execute_commands(&self, handle: &mut Handle<FleetClientHandler>) -> Result<()> {
        for (position, &command_id) in self.job.commands.iter().enumerate() {
            // Ids were validated against the catalog at submission.
            let text = self
                .catalog
                .get(command_id)
                .map(str::to_owned)
                .with_context(|| format!("command id {command_id} missing from catalog"))?;

            tracing::debug!(command = command_id, "executing command");
            let output = self.run_command(handle, &text).await?;
            self.telemetry.record_command_executed();

            if !output.stdout.is_empty() {
                let id = self.store.intern(output.stdout, ResponseChannel::Stdout);
                self.telemetry.record_response_interned();
                self.registry.record_response(
                    self.job.host_index,
                    position,
                    ResponseChannel::Stdout,
                    id,
                );
            }
            if !output.stderr.is_empty() {
                let id = self.store.intern(output.stderr, ResponseChannel::Stderr);
                self.telemetry.record_response_interned();
                self.registry.record_response(
                    self.job.host_index,
                    position,
                    ResponseChannel::Stderr,
                    id,
                );
            }
        }
        Ok(())
    }

    /// Opens a command channel, executes `text`, and drains stdout and
    /// stderr fully into separate buffers, all under the readiness-wait
    /// discipline. Exit code and signal are captured best-effort and are
    /// informational only.
    async fn run_command(
        &self,
        handle: &mut Handle<FleetClientHandler>,
        text: &str,
    ) -> Result<CommandOutput> {
        let mut channel = self
            .waits
            .drive("channel open", handle.channel_open_session())
            .await?
            .context("failed to open command channel")?;

        self.waits
            .drive("command submission", channel.exec(true, text))
            .await?
            .context("failed to submit command for execution")?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = EXIT_CODE_CLOSE_UNCONFIRMED;
        let mut exit_signal = None;

        loop {
            let Some(message) = self.waits.drive("output drain", channel.wait()).await? else {
                break;
            };
            match message {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status,
                ChannelMsg::ExitSignal { signal_name, .. } => exit_signal = Some(signal_name),
                ChannelMsg::Failure => bail!("server refused command execution"),
                _ => {}
            }
        }

        // The server has closed its side; our close is best-effort.
        if let Err(err) = self.waits.drive("channel close", channel.close()).await? {
            tracing::debug!(error = %err, "channel close after drain failed");
        }

        match exit_signal {
            Some(signal) => tracing::debug!(signal = ?signal, "command terminated by signal"),
            None => tracing::debug!(exit_code, "command finished"),
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn disconnect(&self, handle: &Handle<FleetClientHandler>) {
        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "disconnected", "en")
            .await
        {
            tracing::debug!(error = %err, "session disconnect failed");
        }
    }
}
