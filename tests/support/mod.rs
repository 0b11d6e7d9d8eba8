// Shared between test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::env;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use sshfleet::{FleetManager, HostSpec, RunId};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Live-sshd scenarios only run when explicitly enabled, so the default
/// test run needs no SSH server.
pub fn live_ssh_tests_enabled() -> bool {
    match env::var("SSHFLEET_RUN_SSH_TESTS") {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        }
        Err(_) => false,
    }
}

pub fn host(address: &str, commands: Vec<usize>) -> HostSpec {
    HostSpec {
        address: address.to_owned(),
        username: "ops".to_owned(),
        password: "secret".to_owned(),
        key_path: String::new(),
        commands,
    }
}

/// An address nothing listens on: the port is allocated by the OS and the
/// listener dropped before use.
pub fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let address = listener.local_addr().expect("probe listener address");
    drop(listener);
    address.to_string()
}

/// A listener that accepts connections but never speaks SSH; sessions get
/// through TCP connect and then stall in the handshake. The listener must
/// stay alive for the duration of the test.
pub fn silent_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind silent listener");
    let address = listener
        .local_addr()
        .expect("silent listener address")
        .to_string();
    (listener, address)
}

/// A listener that accepts and immediately closes every connection, so the
/// TCP connect succeeds but the SSH handshake fails.
pub async fn spawn_closing_listener() -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => drop(stream),
                Err(_) => break,
            }
        }
    });
    Ok(address)
}

pub async fn wait_for_finished(
    manager: &FleetManager,
    run: RunId,
    target: usize,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let status = manager.status(run)?;
        if status.finished >= target {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!(
                "run did not finish {target} hosts within {:?} (finished: {}, pending: {})",
                timeout,
                status.finished,
                status.pending,
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}
