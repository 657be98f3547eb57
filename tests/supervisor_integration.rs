//! Integration tests for the process supervisor.
//!
//! The backend is a small POSIX shell script that speaks the framed protocol:
//! it reads headers with `read`, the body with `dd`, and answers a handful of
//! methods. Behavior is selected through environment variables:
//!
//! - `FAKE_INIT`: `ok` (default), `error`, `crash`, or `silent`
//! - `FAKE_NOISE=1`: write free text to stdout and stderr before the first frame
//!
//! # Running
//!
//! ```bash
//! cargo test --test supervisor_integration -- --nocapture
//! ```

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use agentlink::ipc::RpcError;
use agentlink::protocol::{ExecuteParams, OutputParams, TaskState};
use agentlink::{ClientConfig, ClientError, ExitEvent, ProcessState, RestartPolicy, Supervisor};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const FAKE_BACKEND: &str = r#"
CR=$(printf '\r')

send() {
  printf 'Content-Length: %d\r\n\r\n%s' "${#1}" "$1"
}

reply() {
  send "{\"jsonrpc\":\"2.0\",\"id\":$1,\"result\":$2}"
}

reply_error() {
  send "{\"jsonrpc\":\"2.0\",\"id\":$1,\"error\":{\"code\":$2,\"message\":\"$3\"}}"
}

notify() {
  send "{\"jsonrpc\":\"2.0\",\"method\":\"$1\",\"params\":$2}"
}

if [ "$FAKE_NOISE" = "1" ]; then
  echo "booting fake backend"
  echo "warming up caches" >&2
  printf '\377\376 binary junk\n' >&2
fi

while :; do
  len=0
  while IFS= read -r line; do
    line=${line%"$CR"}
    [ -z "$line" ] && break
    case "$line" in
      Content-Length:*) len=$(( ${line#*:} + 0 )) ;;
    esac
  done
  [ "$len" -gt 0 ] || exit 0

  body=$(dd bs=1 count="$len" 2>/dev/null)
  id=$(printf '%s' "$body" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  method=$(printf '%s' "$body" | sed -n 's/^{"jsonrpc":"2.0",\("id":[0-9]*,\)\{0,1\}"method":"\([^"]*\)".*/\2/p')

  case "$method" in
    initialize)
      case "$FAKE_INIT" in
        error) reply_error "$id" -32002 "workspace not trusted" ;;
        crash) exit 3 ;;
        silent) ;;
        *) reply "$id" '{"capabilities":{"tasks":true},"serverInfo":{"name":"fake-backend","version":"0.0.1"}}' ;;
      esac ;;
    initialized) ;;
    shutdown) reply "$id" null ;;
    exit) exit 0 ;;
    task/status) reply "$id" '{"taskId":"t-1","state":"running","progress":42.5}' ;;
    task/execute)
      reply "$id" '{"taskId":"t-1","state":"running"}'
      notify task/output '{"taskId":"t-1","text":"hello\n"}'
      notify task/progress '{"taskId":"t-1","percentage":50.0}'
      notify task/complete '{"taskId":"t-1","state":"completed","result":{"ok":true}}'
      ;;
    test/hang) ;;
    test/crash) exit 1 ;;
    *) if [ -n "$id" ]; then reply_error "$id" -32601 "Method not found"; fi ;;
  esac
done
"#;

/// Fake backend script on disk; removed on drop.
struct FakeBackend {
    path: PathBuf,
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn fake_backend(test_name: &str, env: &[(&str, &str)]) -> (ClientConfig, FakeBackend) {
    let pid = std::process::id();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path = std::env::temp_dir().join(format!(
        "agentlink-fake-{}-{}-{}.sh",
        test_name, pid, timestamp
    ));
    std::fs::write(&path, FAKE_BACKEND).expect("Failed to write fake backend");

    let mut config = ClientConfig::for_command("/bin/sh");
    config.args = vec![path.to_string_lossy().into_owned()];
    config.handshake_timeout_ms = 5_000;
    config.shutdown_timeout_ms = 2_000;
    for (key, value) in env {
        config.env.insert(key.to_string(), value.to_string());
    }
    (config, FakeBackend { path })
}

fn exit_events(supervisor: &Supervisor) -> mpsc::UnboundedReceiver<ExitEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    supervisor.on_exit(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn wait_for_state(supervisor: &Supervisor, state: ProcessState) {
    let mut rx = supervisor.subscribe_state();
    timeout(TEST_TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .expect("Timed out waiting for state")
        .expect("State channel closed");
}

#[tokio::test]
async fn test_handshake_and_graceful_shutdown() {
    let (config, _script) = fake_backend("graceful", &[]);
    let supervisor = Supervisor::new(config);
    let mut exits = exit_events(&supervisor);

    let capabilities = timeout(TEST_TIMEOUT, supervisor.start())
        .await
        .expect("Test timed out")
        .expect("Handshake failed");
    assert_eq!(supervisor.state(), ProcessState::Running);
    assert_eq!(capabilities.capabilities, json!({"tasks": true}));
    assert_eq!(capabilities.server_info.unwrap().name, "fake-backend");
    assert!(supervisor.capabilities().is_some());
    assert!(supervisor.pid().await.is_some());

    let status = supervisor
        .status("t-1")
        .await
        .unwrap()
        .expect("backend error");
    assert_eq!(status.state, TaskState::Running);
    assert_eq!(status.progress, Some(42.5));

    timeout(TEST_TIMEOUT, supervisor.shutdown())
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(supervisor.state(), ProcessState::Stopped);

    let event = timeout(TEST_TIMEOUT, exits.recv()).await.unwrap().unwrap();
    assert_eq!(event.code, Some(0));
    assert!(!event.unexpected);

    let err = supervisor.request("task/status", Value::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::NotRunning(ProcessState::Stopped)));
}

#[tokio::test]
async fn test_handshake_error_response() {
    let (config, _script) = fake_backend("init-error", &[("FAKE_INIT", "error")]);
    let supervisor = Supervisor::new(config);

    let err = timeout(TEST_TIMEOUT, supervisor.start())
        .await
        .expect("Test timed out")
        .unwrap_err();
    match err {
        ClientError::Handshake(reason) => assert!(reason.contains("workspace not trusted")),
        other => panic!("Expected Handshake error, got: {:?}", other),
    }
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert!(supervisor.capabilities().is_none());
    assert!(matches!(
        supervisor.notify("task/ping", Value::Null).await,
        Err(ClientError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_handshake_early_exit() {
    let (config, _script) = fake_backend("init-crash", &[("FAKE_INIT", "crash")]);
    let supervisor = Supervisor::new(config);
    let mut exits = exit_events(&supervisor);

    let err = timeout(TEST_TIMEOUT, supervisor.start())
        .await
        .expect("Test timed out")
        .unwrap_err();
    assert!(matches!(err, ClientError::Handshake(_)), "got {:?}", err);
    assert_eq!(supervisor.state(), ProcessState::Stopped);

    let event = timeout(TEST_TIMEOUT, exits.recv()).await.unwrap().unwrap();
    assert_eq!(event.code, Some(3));
}

#[tokio::test]
async fn test_handshake_timeout() {
    let (mut config, _script) = fake_backend("init-silent", &[("FAKE_INIT", "silent")]);
    config.handshake_timeout_ms = 200;
    let supervisor = Supervisor::new(config);

    let err = timeout(TEST_TIMEOUT, supervisor.start())
        .await
        .expect("Test timed out")
        .unwrap_err();
    match err {
        ClientError::Handshake(reason) => assert!(reason.contains("no initialize response")),
        other => panic!("Expected Handshake error, got: {:?}", other),
    }
    assert_eq!(supervisor.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_crash_fails_pending_requests() {
    let (config, _script) = fake_backend("crash", &[]);
    let supervisor = Supervisor::new(config);
    let mut exits = exit_events(&supervisor);
    supervisor.start().await.expect("Handshake failed");

    let first = supervisor.start_request("test/hang", Value::Null).await.unwrap();
    let second = supervisor.start_request("test/hang", Value::Null).await.unwrap();
    let crash = supervisor.start_request("test/crash", Value::Null).await.unwrap();

    for pending in [first, second, crash] {
        let result = timeout(TEST_TIMEOUT, pending.wait()).await.expect("Test timed out");
        match result {
            Err(e) => assert!(e.is_transport_failure(), "got {:?}", e),
            Ok(reply) => panic!("Expected transport failure, got: {:?}", reply),
        }
    }

    let event = timeout(TEST_TIMEOUT, exits.recv()).await.unwrap().unwrap();
    assert_eq!(event.code, Some(1));
    assert!(event.unexpected);

    wait_for_state(&supervisor, ProcessState::Stopped).await;
    let err = supervisor.request("task/status", Value::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::NotRunning(_)));
}

#[tokio::test]
async fn test_restart_after_crash() {
    let (mut config, _script) = fake_backend("restart", &[]);
    config.restart = RestartPolicy::OnCrash {
        max_restarts: 1,
        backoff_ms: 50,
    };
    let supervisor = Supervisor::new(config);
    let mut exits = exit_events(&supervisor);
    supervisor.start().await.expect("Handshake failed");
    let first_pid = supervisor.pid().await;

    let crash = supervisor.start_request("test/crash", Value::Null).await.unwrap();
    assert!(timeout(TEST_TIMEOUT, crash.wait()).await.unwrap().is_err());

    let event = timeout(TEST_TIMEOUT, exits.recv()).await.unwrap().unwrap();
    assert!(event.unexpected);

    wait_for_state(&supervisor, ProcessState::Running).await;
    assert_ne!(supervisor.pid().await, first_pid);

    let status = supervisor.status("t-1").await.unwrap().unwrap();
    assert_eq!(status.task_id, "t-1");

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_during_backoff_cancels_restart() {
    let (mut config, _script) = fake_backend("restart-cancel", &[]);
    config.restart = RestartPolicy::OnCrash {
        max_restarts: 3,
        backoff_ms: 400,
    };
    let supervisor = Supervisor::new(config);
    let mut exits = exit_events(&supervisor);
    supervisor.start().await.expect("Handshake failed");
    assert!(supervisor.capabilities().is_some());

    let crash = supervisor.start_request("test/crash", Value::Null).await.unwrap();
    assert!(timeout(TEST_TIMEOUT, crash.wait()).await.unwrap().is_err());
    timeout(TEST_TIMEOUT, exits.recv()).await.unwrap().unwrap();
    wait_for_state(&supervisor, ProcessState::Stopped).await;
    assert_eq!(supervisor.capabilities(), None);

    supervisor.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert_eq!(supervisor.pid().await, None);

    // An explicit start still works after the cancelled restart.
    supervisor.start().await.expect("Handshake failed");
    assert_eq!(supervisor.state(), ProcessState::Running);
    supervisor.shutdown().await.unwrap();
    assert_eq!(supervisor.capabilities(), None);
}

#[tokio::test]
async fn test_execute_streams_notifications() {
    let (config, _script) = fake_backend("execute", &[]);
    let supervisor = Supervisor::new(config);

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<OutputParams>();
    supervisor.on_output(move |out| {
        let _ = output_tx.send(out);
    });
    let (complete_tx, mut complete_rx) = mpsc::unbounded_channel();
    supervisor.on_complete(move |complete| {
        let _ = complete_tx.send(complete);
    });
    let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
    let progress_sink = Arc::clone(&progress);
    supervisor.on_progress(move |p| {
        progress_sink.lock().unwrap().push(p.percentage);
    });

    supervisor.start().await.expect("Handshake failed");
    let task = supervisor
        .execute(&ExecuteParams::new("say hello"))
        .await
        .unwrap()
        .expect("backend error");
    assert_eq!(task.task_id, "t-1");

    let output = timeout(TEST_TIMEOUT, output_rx.recv()).await.unwrap().unwrap();
    assert_eq!(output.text, "hello\n");

    let complete = timeout(TEST_TIMEOUT, complete_rx.recv()).await.unwrap().unwrap();
    assert_eq!(complete.state, TaskState::Completed);
    assert_eq!(complete.result, Some(json!({"ok": true})));
    // Notifications are handled in arrival order, so progress came first.
    assert_eq!(*progress.lock().unwrap(), vec![Some(50.0)]);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_backend_error() {
    let (config, _script) = fake_backend("unknown", &[]);
    let supervisor = Supervisor::new(config);
    supervisor.start().await.expect("Handshake failed");

    let reply = supervisor
        .request("task/teleport", json!({"to": "mars"}))
        .await
        .expect("not a transport failure");
    assert_eq!(reply, Err(RpcError::new(-32601, "Method not found")));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_free_text_on_stdout_and_stderr_is_tolerated() {
    let (config, _script) = fake_backend("noise", &[("FAKE_NOISE", "1")]);
    let supervisor = Supervisor::new(config);

    timeout(TEST_TIMEOUT, supervisor.start())
        .await
        .expect("Test timed out")
        .expect("Handshake failed");
    let status = supervisor.status("t-1").await.unwrap().unwrap();
    assert_eq!(status.state, TaskState::Running);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_timeout_from_config() {
    let (mut config, _script) = fake_backend("timeout", &[]);
    config.request_timeout_ms = Some(100);
    let supervisor = Supervisor::new(config);
    supervisor.start().await.expect("Handshake failed");

    let err = supervisor.request("test/hang", Value::Null).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    assert_eq!(supervisor.state(), ProcessState::Running);

    supervisor.shutdown().await.unwrap();
}
