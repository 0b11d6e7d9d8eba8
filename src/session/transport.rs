use crate::runtime::config::FleetConfig;
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Context, Result};
use russh::client;
use russh::{MethodKind, MethodSet, Preferred};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{self, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Client-side handler for the SSH session. Host-key verification is
/// outside the engine's contract; any server key is accepted.
pub(crate) struct FleetClientHandler;

impl client::Handler for FleetClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Session configuration: the protocol-level inactivity timeout stays
/// disabled because commands may run arbitrarily long, and compression is
/// requested in the method preferences to speed up large transfers.
pub(crate) fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        preferred: Preferred::COMPRESSED,
        ..Default::default()
    })
}

/// Splits an optional `host:port` (or `[v6]:port`) suffix off an address,
/// falling back to `default_port`.
pub(crate) fn split_address(address: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, suffix)) = rest.split_once(']') {
            if let Some(port) = suffix.strip_prefix(':').and_then(|p| p.parse().ok()) {
                return (host.to_owned(), port);
            }
            return (host.to_owned(), default_port);
        }
    }
    match address.split_once(':') {
        Some((host, port_str)) if !host.is_empty() && !port_str.contains(':') => {
            match port_str.parse() {
                Ok(port) => (host.to_owned(), port),
                Err(_) => (address.to_owned(), default_port),
            }
        }
        _ => (address.to_owned(), default_port),
    }
}

async fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    match net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(err) => {
            tracing::debug!(host, error = %err, "address resolution failed; attempting direct connect");
            None
        }
    }
}

/// Opens the TCP transport to a host, resolving the address first and
/// falling back to a direct connect when resolution yields nothing.
pub(crate) async fn open_transport(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let stream = time::timeout(connect_timeout, async {
        match resolve(host, port).await {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect((host, port)).await,
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("connect to {host}:{port} timed out"))?
    .with_context(|| format!("failed to connect to {host}:{port}"))?;
    Ok(stream)
}

pub(crate) fn offers(methods: &MethodSet, kind: MethodKind) -> bool {
    methods.iter().any(|method| *method == kind)
}

/// The readiness-wait discipline for channel operations.
///
/// An operation is polled in bounded windows. An expired window is not a
/// failure: the stall is counted, logged, and the same operation keeps
/// being driven, until the optional cumulative budget runs out or the run
/// is cancelled, either of which turns the stall into a hard error.
pub(crate) struct ReadyWait {
    window: Duration,
    budget: Option<Duration>,
    cancel: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl ReadyWait {
    pub(crate) fn new(
        config: &FleetConfig,
        cancel: CancellationToken,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            window: config.ready_wait(),
            budget: config.stall_budget(),
            cancel,
            telemetry,
        }
    }

    pub(crate) async fn drive<F>(&self, what: &str, operation: F) -> Result<F::Output>
    where
        F: Future,
    {
        tokio::pin!(operation);
        let mut stalled = Duration::ZERO;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    bail!("{what} aborted: run cancelled");
                }
                outcome = time::timeout(self.window, &mut operation) => {
                    match outcome {
                        Ok(output) => return Ok(output),
                        Err(_) => {
                            stalled += self.window;
                            self.telemetry.record_readiness_stall();
                            if let Some(budget) = self.budget {
                                if stalled >= budget {
                                    bail!(
                                        "{what} stalled for {:?} (budget {:?})",
                                        stalled,
                                        budget,
                                    );
                                }
                            }
                            tracing::trace!(
                                operation = what,
                                waited = ?stalled,
                                "still waiting for channel readiness"
                            );
                        }
                    }
                }
            }
        }
    }
}
