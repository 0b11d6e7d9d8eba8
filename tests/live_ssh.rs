//! Scenarios against a real sshd, gated behind `SSHFLEET_RUN_SSH_TESTS`.
//!
//! Connection parameters come from the environment:
//! `SSHFLEET_TEST_HOST` (default `127.0.0.1:22`), `SSHFLEET_TEST_USER`,
//! and `SSHFLEET_TEST_PASSWORD` or `SSHFLEET_TEST_KEY`.

#[path = "support/mod.rs"]
mod support;

use std::env;
use std::time::Duration;

use sshfleet::{
    FleetConfig, FleetManager, HostErrorCode, HostSpec, ResponseChannel, RunReport,
};
use tokio::time::timeout;

fn live_host(commands: Vec<usize>) -> HostSpec {
    HostSpec {
        address: env::var("SSHFLEET_TEST_HOST").unwrap_or_else(|_| "127.0.0.1:22".to_owned()),
        username: env::var("SSHFLEET_TEST_USER").unwrap_or_default(),
        password: env::var("SSHFLEET_TEST_PASSWORD").unwrap_or_default(),
        key_path: env::var("SSHFLEET_TEST_KEY").unwrap_or_default(),
        commands,
    }
}

async fn run_fleet(hosts: Vec<HostSpec>, commands: Vec<String>) -> RunReport {
    let manager = FleetManager::new(FleetConfig::default());
    let run = manager.start(hosts, commands).expect("run starts");
    timeout(Duration::from_secs(60), manager.join(run))
        .await
        .expect("run completes in time")
        .expect("join succeeds");
    manager.result(run).expect("result after completion")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_hosts_capture_echo_output_and_share_one_store_entry() {
    if !support::live_ssh_tests_enabled() {
        eprintln!("skipping live ssh test; set SSHFLEET_RUN_SSH_TESTS=1 to enable");
        return;
    }
    support::init_tracing();

    let report = run_fleet(
        vec![live_host(vec![0, 1]), live_host(vec![0, 1])],
        vec!["echo hi".to_owned(), "true".to_owned()],
    )
    .await;

    assert_eq!(report.hosts.len(), 2);
    for host in &report.hosts {
        assert_eq!(host.error, HostErrorCode::Success);

        let echo = &host.commands[0];
        let stdout_id = echo.stdout_response_id.expect("echo produced stdout");
        assert_eq!(
            report.responses[stdout_id],
            ("hi\n".to_owned(), ResponseChannel::Stdout)
        );
        assert_eq!(echo.stderr_response_id, None);

        let quiet = &host.commands[1];
        assert_eq!(quiet.stdout_response_id, None);
        assert_eq!(quiet.stderr_response_id, None);
    }

    // Identical text from both hosts interned exactly once.
    assert_eq!(
        report.hosts[0].commands[0].stdout_response_id,
        report.hosts[1].commands[0].stdout_response_id,
    );
    let echo_entries = report
        .responses
        .iter()
        .filter(|(text, channel)| text == "hi\n" && *channel == ResponseChannel::Stdout)
        .count();
    assert_eq!(echo_entries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_uname_output_across_hosts_is_stored_once() {
    if !support::live_ssh_tests_enabled() {
        eprintln!("skipping live ssh test; set SSHFLEET_RUN_SSH_TESTS=1 to enable");
        return;
    }
    support::init_tracing();

    let report = run_fleet(
        vec![live_host(vec![0]), live_host(vec![0])],
        vec!["uname -a".to_owned()],
    )
    .await;

    let first = report.hosts[0].commands[0]
        .stdout_response_id
        .expect("uname produced stdout");
    let second = report.hosts[1].commands[0]
        .stdout_response_id
        .expect("uname produced stdout");
    assert_eq!(first, second, "identical output must map to one id");

    let stdout_entries = report
        .responses
        .iter()
        .filter(|(_, channel)| *channel == ResponseChannel::Stdout)
        .count();
    assert_eq!(stdout_entries, 1);
}
