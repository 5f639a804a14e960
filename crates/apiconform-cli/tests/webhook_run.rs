//! Runs the `apiconform` binary against a local server that answers
//! subscriptions with a webhook to the callback it was given.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tiny_http::{Header, Response, Server};

/// Answers `POST /subscriptions` with 201 and, shortly after, sends
/// `PUT <callback>` with the subscription event.
fn subscription_server() -> String {
    let server = Server::http("127.0.0.1:0").unwrap();
    let url = format!("http://{}", server.server_addr().to_ip().unwrap());
    thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let callback = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["callback"].as_str().map(str::to_string))
                .filter(|c| c.starts_with("http://"));

            let json_type =
                Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
            let response = Response::from_string(json!({"id": "sub-1"}).to_string())
                .with_status_code(201)
                .with_header(json_type);
            request.respond(response).unwrap();

            if let Some(callback) = callback {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    reqwest::blocking::Client::builder()
                        .no_proxy()
                        .build()
                        .unwrap()
                        .put(callback)
                        .header("Content-Type", "application/json")
                        .body(json!({"id": "sub-1", "event": "created"}).to_string())
                        .send()
                        .unwrap();
                });
            }
        }
    });
    url
}

const SUITE: &str = r#"
groups:
  - name: subscriptions
    steps:
      - name: subscribe
        request:
          method: POST
          path: /subscriptions
          body: { callback: "{listener_url}/bob/webhook" }
        expect: { status: 201 }
        save: { sub_id: /id }
    async:
      - name: created event delivered
        identity: bob
        request:
          method: PUT
          path: /bob/webhook
          properties: { id: "{sub_id}", event: created }
        respond: { status: 200 }
"#;

fn write_config(dir: &Path, base_url: &str, listener: bool, timeout_ms: u64) -> PathBuf {
    let mut config = format!(
        r#"base_url = "{base_url}"

[correlation]
poll_interval_ms = 50
timeout_ms = {timeout_ms}
"#
    );
    if listener {
        config.push_str("\n[listener]\naddress = \"127.0.0.1:0\"\n");
    }
    let path = dir.join("apiconform.toml");
    std::fs::write(&path, config).unwrap();
    path
}

fn run(dir: &Path, config: &Path, extra: &[&str]) -> Output {
    let suite = dir.join("suite.yaml");
    std::fs::write(&suite, SUITE).unwrap();
    Command::new(env!("CARGO_BIN_EXE_apiconform"))
        .current_dir(dir)
        .env("NO_PROXY", "127.0.0.1,localhost")
        .env_remove("RUST_LOG")
        .args(["--output", "json"])
        .args(extra)
        .arg("run")
        .arg(&suite)
        .arg("--config")
        .arg(config)
        .output()
        .unwrap()
}

fn report(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "no JSON report ({e}); stderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn webhook_is_received_by_the_listener_and_correlated() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &subscription_server(), true, 3000);

    let output = run(dir.path(), &config, &[]);
    let report = report(&output);
    assert_eq!(output.status.code(), Some(0), "{report:#}");
    assert_eq!(report["results"]["subscriptions"]["valid"], true);
    let webhook = report["results"]["subscriptions"]["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["kind"]["type"] == "async")
        .unwrap();
    assert_eq!(webhook["actual"]["request"]["path"], "/bob/webhook");
    assert_eq!(webhook["actual"]["response"]["status"], 200);
    assert_eq!(report["summary"]["failed"], 0);
    assert_eq!(report["summary"]["inconclusive"], 0);
    assert_eq!(report["summary"]["unmatched"], 0);
}

#[test]
fn without_listener_the_webhook_stays_inconclusive() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &subscription_server(), false, 300);

    let lenient = run(dir.path(), &config, &[]);
    let report = report(&lenient);
    assert_eq!(report["summary"]["inconclusive"], 1);
    assert_eq!(lenient.status.code(), Some(0));

    let strict = run(dir.path(), &config, &["--strict"]);
    assert_eq!(strict.status.code(), Some(1));
}
