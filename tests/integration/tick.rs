//! Check-tick behavior against a canned Consul agent.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::json;
use tempfile::{TempDir, tempdir};

use apollo::config::Config;
use apollo::daemon::Daemon;
use apollo::heal;
use apollo::ledger::RetryLedger;
use apollo::verdict::Verdict;

/// Minimal HTTP agent that routes on the request path and records every
/// request line it sees.
struct FakeAgent {
    endpoint: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeAgent {
    fn spawn(node_body: String, service_body: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 16384];
                let n = match stream.read(&mut buf) {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let first_line =
                    request.lines().next().unwrap_or_default().to_string();
                seen.lock().unwrap().push(first_line.clone());

                let body = if first_line.contains("/v1/health/node/") {
                    node_body.clone()
                } else if first_line.contains("/v1/health/service/") {
                    service_body.clone()
                } else {
                    String::from("{}")
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        Self { endpoint, requests }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn node_body(hostname: &str, status: &str, output: &str) -> String {
    json!([
        {
            "Node": hostname,
            "CheckID": "service:www",
            "Name": "www",
            "ServiceID": "www",
            "Status": status,
            "Output": output,
        },
        {
            "Node": hostname,
            "CheckID": "serfHealth",
            "Name": "Serf Health Status",
            "Status": "passing",
            "Output": "Agent alive and reachable",
        }
    ])
    .to_string()
}

/// Ten members total; `critical` of them failing, named w01, w02, ….
fn service_body(critical: usize) -> String {
    let members: Vec<_> = (1..=10)
        .map(|i| {
            let status = if i <= critical { "critical" } else { "passing" };
            json!({
                "Node": { "Node": format!("w{i:02}") },
                "Checks": [
                    {
                        "CheckID": "serfHealth",
                        "Name": "Serf Health Status",
                        "Status": "passing",
                    },
                    {
                        "CheckID": "service:www",
                        "Name": "www",
                        "ServiceID": "www",
                        "Status": status,
                    }
                ]
            })
        })
        .collect();
    json!(members).to_string()
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().to_string()
}

fn build_daemon(
    dir: &TempDir,
    agent: &FakeAgent,
    hostname: &str,
    exit_code: i32,
    extra: &str,
) -> Daemon {
    let script =
        write_script(dir.path(), "check", &format!("#!/bin/sh\nexit {exit_code}\n"));
    let track = dir.path().join("track");
    fs::create_dir_all(&track).unwrap();

    let config: Config = serde_yaml::from_str(&format!(
        r#"
service_name: www
service_cmd: {script}
hostname: {hostname}
colo: dc1
threshold_down: "30%"
consul_endpoint: {endpoint}
track_directory: {track}
bad_status_file: {bad}
report_file: {report}
healing_active_status_file: {active}
healing_last_heal_file: {last}
{extra}
"#,
        endpoint = agent.endpoint,
        track = track.display(),
        bad = dir.path().join("bad_status").display(),
        report = dir.path().join("report.txt").display(),
        active = dir.path().join("healing_active").display(),
        last = dir.path().join("last_heal.json").display(),
    ))
    .unwrap();

    Daemon::new(config).unwrap()
}

#[test]
fn lone_failure_below_threshold_goes_critical() {
    let dir = tempdir().unwrap();
    let agent = FakeAgent::spawn(
        node_body("w01", "passing", "by:apollo Last change was on 100"),
        service_body(1),
    );
    let daemon = build_daemon(&dir, &agent, "w01", 2, "");

    let spec = daemon.config().check_specs().pop().unwrap();
    daemon.run_check_tick(&spec);

    let requests = agent.requests();
    let push = requests
        .iter()
        .find(|line| line.starts_with("PUT /v1/agent/check/"))
        .expect("a check update was pushed");
    assert!(push.starts_with("PUT /v1/agent/check/fail/service:www?note=by%3Aapollo"));
    // A fresh transition carries a new timestamp, not the old one.
    assert!(!push.contains("on+100 "));

    assert!(dir.path().join("bad_status").exists());
    assert!(daemon.snapshot().is_some());

    let ledger = RetryLedger::load(&dir.path().join("track"), "www");
    assert_eq!(ledger.entries().len(), 1);
    assert_eq!(ledger.entries()[0].verdict, Verdict::Bad);
}

#[test]
fn exhausted_budget_keeps_the_host_in_rotation() {
    let dir = tempdir().unwrap();
    // Four of ten members failing against a 30% budget; this host is not in
    // the accepted prefix.
    let agent = FakeAgent::spawn(
        node_body("w41", "passing", "by:apollo Last change was on 100"),
        service_body(4),
    );
    let daemon = build_daemon(&dir, &agent, "w41", 2, "");

    let spec = daemon.config().check_specs().pop().unwrap();
    daemon.run_check_tick(&spec);

    let requests = agent.requests();
    let push = requests
        .iter()
        .find(|line| line.starts_with("PUT /v1/agent/check/"))
        .expect("a check update was pushed");
    assert!(push.starts_with("PUT /v1/agent/check/pass/service:www?note=by%3Aapollo"));
    // Passing over passing preserves the original transition timestamp.
    assert!(push.contains("100"));

    assert!(!dir.path().join("bad_status").exists());
    assert!(daemon.snapshot().is_none());

    let ledger = RetryLedger::load(&dir.path().join("track"), "www");
    assert_eq!(ledger.entries()[0].verdict, Verdict::Ok);
}

#[test]
fn accepted_failure_inside_the_prefix_goes_critical() {
    let dir = tempdir().unwrap();
    // Four failing members, budget three, and this host sorts into the
    // accepted prefix.
    let agent = FakeAgent::spawn(
        node_body("w02", "passing", "by:apollo Last change was on 100"),
        service_body(4),
    );
    let daemon = build_daemon(&dir, &agent, "w02", 2, "");

    let spec = daemon.config().check_specs().pop().unwrap();
    daemon.run_check_tick(&spec);

    let requests = agent.requests();
    let push = requests
        .iter()
        .find(|line| line.starts_with("PUT /v1/agent/check/"))
        .expect("a check update was pushed");
    assert!(push.starts_with("PUT /v1/agent/check/fail/service:www?note=by%3Aapollo"));
    assert!(daemon.snapshot().is_some());
}

#[test]
fn oor_pushes_fail_without_claiming_authorship() {
    let dir = tempdir().unwrap();
    let agent = FakeAgent::spawn(
        node_body("w01", "passing", "by:apollo Last change was on 100"),
        service_body(0),
    );
    let daemon = build_daemon(&dir, &agent, "w01", 3, "");

    let spec = daemon.config().check_specs().pop().unwrap();
    daemon.run_check_tick(&spec);

    let requests = agent.requests();
    let push = requests
        .iter()
        .find(|line| line.starts_with("PUT /v1/agent/check/"))
        .expect("a check update was pushed");
    assert!(push.starts_with("PUT /v1/agent/check/fail/service:www?note=Last"));
    assert!(!push.contains("by%3Aapollo"));

    // OOR leaves no trace in the retry ledger.
    let ledger = RetryLedger::load(&dir.path().join("track"), "www");
    assert!(ledger.entries().is_empty());
}

#[test]
fn fast_heal_runs_immediately_whatever_the_status_gate_says() {
    let dir = tempdir().unwrap();
    let agent = FakeAgent::spawn(
        node_body("w01", "passing", "by:apollo Last change was on 100"),
        service_body(0),
    );

    let heal_marker = dir.path().join("heal_ran");
    let heal_script = write_script(
        dir.path(),
        "heal",
        &format!(
            "#!/bin/sh\necho \"fast=$APOLLO_FAST_HEALING\" > {}\nexit 0\n",
            heal_marker.display()
        ),
    );

    // heal_on_status gates on critical while the host is passing, so only
    // the fast-heal channel can start this heal.
    let daemon = build_daemon(
        &dir,
        &agent,
        "w01",
        100,
        &format!("heal_cmd: {heal_script}\nheal_on_status: critical"),
    );

    // Consume the always-skipped first firing, as the heal timer would.
    heal::run_heal(&daemon, false);
    assert!(!heal_marker.exists());

    let spec = daemon.config().check_specs().pop().unwrap();
    daemon.run_check_tick(&spec);

    let requests = agent.requests();
    let push = requests
        .iter()
        .find(|line| line.starts_with("PUT /v1/agent/check/"))
        .expect("a check update was pushed");
    assert!(push.starts_with("PUT /v1/agent/check/pass/service:www?note=by%3Aapollo"));

    let recorded = fs::read_to_string(&heal_marker).expect("heal command ran");
    assert_eq!(recorded.trim(), "fast=1");

    let last_heal = fs::read_to_string(dir.path().join("last_heal.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(&last_heal).unwrap();
    assert_eq!(record["status"], "healed");
    assert_eq!(record["fast"], true);
    assert!(!dir.path().join("healing_active").exists());
}

#[test]
fn registration_covers_every_service() {
    let dir = tempdir().unwrap();
    let agent = FakeAgent::spawn(node_body("w01", "passing", ""), service_body(0));
    let script = write_script(dir.path(), "check", "#!/bin/sh\nexit 0\n");

    let config: Config = serde_yaml::from_str(&format!(
        r#"
service_name: www
service_cmd: {script}
hostname: w01
colo: dc1
consul_endpoint: {endpoint}
extra_service:
  httpok:
    healthcheck: {script}
"#,
        endpoint = agent.endpoint,
    ))
    .unwrap();
    let daemon = Daemon::new(config).unwrap();

    daemon.register_services().unwrap();

    let requests = agent.requests();
    let registrations = requests
        .iter()
        .filter(|line| line.starts_with("PUT /v1/agent/service/register"))
        .count();
    assert_eq!(registrations, 2);
}
