// ABOUTME: End-to-end activation tests against an in-memory substrate and an in-process fake runtime
// ABOUTME: Covers cold/warm starts, application and developer errors, timeouts, and reuse policy

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use penguinwhisk_invoker::executor::Executor;
use penguinwhisk_messaging::{
    InvocationMessage, STATUS_APPLICATION_ERROR, STATUS_DEVELOPER_ERROR, STATUS_INTERNAL_ERROR,
    STATUS_SUCCESS,
};
use penguinwhisk_sandbox::fake::FakeSubstrate;
use penguinwhisk_sandbox::{LogCollector, PoolConfig, RuntimeProxy, SandboxPool};

/// Canned response a fake endpoint returns for one request.
#[derive(Clone)]
struct Canned {
    status: u16,
    body: String,
    delay: Duration,
}

impl Canned {
    fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type RouteFn = dyn Fn(&str) -> Canned + Send + Sync;

/// Minimal HTTP/1.1 server: reads one request per connection and answers
/// from the route table. Stands in for both the runtime and blob store.
async fn spawn_server(routes: Arc<RouteFn>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let path = loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(path) = request_path_when_complete(&buf) {
                        break path;
                    }
                };

                let canned = routes(&path);
                tokio::time::sleep(canned.delay).await;

                let reason = match canned.status {
                    200 => "OK",
                    404 => "Not Found",
                    502 => "Bad Gateway",
                    _ => "Error",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    canned.status,
                    reason,
                    canned.body.len(),
                    canned.body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    port
}

/// Returns the request path once the full request (headers + body) has
/// arrived.
fn request_path_when_complete(buf: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(buf).ok()?;
    let header_end = text.find("\r\n\r\n")?;
    let headers = &text[..header_end];

    let content_length = headers
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    if buf.len() < header_end + 4 + content_length {
        return None;
    }

    let path = headers.lines().next()?.split_whitespace().nth(1)?;
    Some(path.to_string())
}

struct Harness {
    executor: Executor,
    fake: Arc<FakeSubstrate>,
    pool: Arc<SandboxPool>,
}

fn harness(runtime_port: u16) -> Harness {
    let fake = FakeSubstrate::with_addr("127.0.0.1");
    let pool = SandboxPool::new(
        fake.clone(),
        PoolConfig {
            max_size: 10,
            idle_timeout: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(3600),
        },
    );
    let proxy = Arc::new(RuntimeProxy::with_port(runtime_port).unwrap());
    let collector = Arc::new(LogCollector::new(fake.clone()));
    let executor = Executor::new(pool.clone(), proxy, collector).unwrap();

    Harness {
        executor,
        fake,
        pool,
    }
}

fn message(code_url: &str, deadline_in_ms: i64, timeout_ms: i64) -> InvocationMessage {
    serde_json::from_value(serde_json::json!({
        "activation_id": "act-1",
        "action": {
            "namespace": "guest",
            "name": "hello",
            "version": "0.0.1",
            "exec": {
                "kind": "nodejs:20",
                "code_url": code_url,
                "main": "main"
            },
            "limits": { "timeout": timeout_ms, "memory": 128, "logs": 64 }
        },
        "params": { "name": "world" },
        "deadline": Utc::now().timestamp_millis() + deadline_in_ms,
        "context": { "namespace": "guest", "api_host": "http://controller:8080", "api_key": "k" }
    }))
    .unwrap()
}

#[tokio::test]
async fn cold_start_success_then_warm_reuse() {
    let init_calls = Arc::new(AtomicUsize::new(0));
    let code_fetches = Arc::new(AtomicUsize::new(0));

    let routes: Arc<RouteFn> = {
        let init_calls = init_calls.clone();
        let code_fetches = code_fetches.clone();
        Arc::new(move |path| match path {
            "/init" => {
                init_calls.fetch_add(1, Ordering::SeqCst);
                Canned::json(200, r#"{"ok":true}"#)
            }
            "/run" => Canned::json(200, r#"{"hello":"world"}"#),
            "/code" => {
                code_fetches.fetch_add(1, Ordering::SeqCst);
                Canned::json(200, "function main(p){return {hello:p.name}}")
            }
            _ => Canned::json(404, r#"{"error":"not found"}"#),
        })
    };
    let port = spawn_server(routes).await;
    let h = harness(port);

    let msg = message(&format!("http://127.0.0.1:{}/code", port), 10_000, 5_000);

    // Seed sandbox output for the first activation; FakeSubstrate ids are
    // deterministic, so sbx-1 is the sandbox this invocation will create.
    let soon = Utc::now() + chrono::Duration::seconds(1);
    h.fake.push_log("sbx-1", 1, soon, "hello from action");
    h.fake
        .push_log("sbx-1", 1, soon, "XXX_THE_END_OF_A_WHISK_ACTIVATION_XXX");

    let result = h.executor.execute(&msg).await;
    assert_eq!(result.status_code, STATUS_SUCCESS);
    assert!(result.response.success);
    assert_eq!(result.response.result.as_ref().unwrap()["hello"], "world");
    assert!(result.duration >= 0);
    assert_eq!(result.annotations["coldStart"], true);
    assert!(result.logs.iter().any(|l| l.contains("hello from action")));
    assert!(!result.logs.iter().any(|l| l.contains("XXX_THE_END")));

    // Second identical invocation: same sandbox, no new /init, no fetch.
    let result = h.executor.execute(&msg).await;
    assert_eq!(result.status_code, STATUS_SUCCESS);
    assert_eq!(result.annotations["coldStart"], false);
    assert_eq!(h.fake.created_count(), 1);
    assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(code_fetches.load(Ordering::SeqCst), 1);

    let stats = h.pool.stats();
    assert_eq!(stats.warm.get("nodejs:20"), Some(&1));
}

#[tokio::test]
async fn application_error_keeps_the_sandbox() {
    let routes: Arc<RouteFn> = Arc::new(|path| match path {
        "/init" => Canned::json(200, r#"{"ok":true}"#),
        "/run" => Canned::json(200, r#"{"error":"nope"}"#),
        "/code" => Canned::json(200, "function main(){return {error:'nope'}}"),
        _ => Canned::json(404, "{}"),
    });
    let port = spawn_server(routes).await;
    let h = harness(port);

    let msg = message(&format!("http://127.0.0.1:{}/code", port), 10_000, 5_000);
    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_APPLICATION_ERROR);
    assert!(!result.response.success);
    assert_eq!(result.response.error.as_deref(), Some("nope"));
    assert_eq!(
        result.response.result.as_ref().unwrap()["error"],
        "nope"
    );

    // The runtime answered cleanly, so the sandbox is safe to reuse.
    assert!(h.fake.removed_ids().is_empty());
    assert_eq!(h.pool.stats().warm.get("nodejs:20"), Some(&1));
}

#[tokio::test]
async fn thrown_error_destroys_the_sandbox() {
    let routes: Arc<RouteFn> = Arc::new(|path| match path {
        "/init" => Canned::json(200, r#"{"ok":true}"#),
        "/run" => Canned::json(502, r#"{"error":"boom"}"#),
        "/code" => Canned::json(200, "function main(){throw new Error('boom')}"),
        _ => Canned::json(404, "{}"),
    });
    let port = spawn_server(routes).await;
    let h = harness(port);

    let msg = message(&format!("http://127.0.0.1:{}/code", port), 10_000, 5_000);
    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_DEVELOPER_ERROR);
    assert_eq!(result.response.error.as_deref(), Some("boom"));
    assert_eq!(h.fake.removed_ids().len(), 1);
    assert!(h.pool.stats().warm.is_empty());
}

#[tokio::test]
async fn hung_action_times_out_and_destroys_the_sandbox() {
    let routes: Arc<RouteFn> = Arc::new(|path| match path {
        "/init" => Canned::json(200, r#"{"ok":true}"#),
        "/run" => Canned::json(200, "{}").slow(Duration::from_secs(5)),
        "/code" => Canned::json(200, "function main(){while(true){}}"),
        _ => Canned::json(404, "{}"),
    });
    let port = spawn_server(routes).await;
    let h = harness(port);

    let msg = message(&format!("http://127.0.0.1:{}/code", port), 10_000, 500);
    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_INTERNAL_ERROR);
    assert!(result
        .response
        .error
        .as_ref()
        .unwrap()
        .contains("allowed time"));
    assert_eq!(h.fake.removed_ids().len(), 1);
}

#[tokio::test]
async fn init_rejection_is_a_developer_error() {
    let routes: Arc<RouteFn> = Arc::new(|path| match path {
        "/init" => Canned::json(502, r#"{"error":"cannot compile"}"#),
        "/code" => Canned::json(200, "not even javascript"),
        _ => Canned::json(404, "{}"),
    });
    let port = spawn_server(routes).await;
    let h = harness(port);

    let msg = message(&format!("http://127.0.0.1:{}/code", port), 10_000, 5_000);
    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_DEVELOPER_ERROR);
    assert_eq!(result.response.error.as_deref(), Some("cannot compile"));
    assert_eq!(h.fake.removed_ids().len(), 1);
}

#[tokio::test]
async fn unreachable_sandbox_is_an_internal_error() {
    let blob_routes: Arc<RouteFn> =
        Arc::new(|_| Canned::json(200, "function main(p){return p}"));
    let blob_port = spawn_server(blob_routes).await;

    // Nothing listens on port 1: every connect is refused.
    let h = harness(1);
    let msg = message(&format!("http://127.0.0.1:{}/code", blob_port), 10_000, 5_000);
    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_INTERNAL_ERROR);
    assert_eq!(h.fake.removed_ids().len(), 1);
}

#[tokio::test]
async fn code_fetch_failure_is_internal_and_destroys_the_sandbox() {
    let routes: Arc<RouteFn> = Arc::new(|path| match path {
        "/code" => Canned::json(404, r#"{"error":"no such object"}"#),
        _ => Canned::json(200, r#"{"ok":true}"#),
    });
    let port = spawn_server(routes).await;
    let h = harness(port);

    let msg = message(&format!("http://127.0.0.1:{}/code", port), 10_000, 5_000);
    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_INTERNAL_ERROR);
    assert!(result
        .response
        .error
        .as_ref()
        .unwrap()
        .contains("fetch action code"));
    assert_eq!(h.fake.removed_ids().len(), 1);
}

#[tokio::test]
async fn expired_deadline_never_creates_a_sandbox() {
    let h = harness(1);
    let msg = message("http://127.0.0.1:1/code", -1_000, 5_000);

    let result = h.executor.execute(&msg).await;

    assert_eq!(result.status_code, STATUS_INTERNAL_ERROR);
    assert!(result
        .response
        .error
        .as_ref()
        .unwrap()
        .contains("deadline already exceeded"));
    assert_eq!(h.fake.created_count(), 0);
}

#[tokio::test]
async fn health_probe_accepts_both_ready_shapes() {
    let ok_routes: Arc<RouteFn> = Arc::new(|_| Canned::json(200, r#"{"ok":true}"#));
    let ok_port = spawn_server(ok_routes).await;

    let ready_routes: Arc<RouteFn> = Arc::new(|_| Canned::json(200, r#"{"status":"ready"}"#));
    let ready_port = spawn_server(ready_routes).await;

    let not_ready_routes: Arc<RouteFn> = Arc::new(|_| Canned::json(200, r#"{"status":"booting"}"#));
    let not_ready_port = spawn_server(not_ready_routes).await;

    let timeout = Duration::from_secs(2);
    let proxy = RuntimeProxy::with_port(ok_port).unwrap();
    assert!(proxy.health("127.0.0.1", timeout).await.unwrap());

    let proxy = RuntimeProxy::with_port(ready_port).unwrap();
    assert!(proxy.health("127.0.0.1", timeout).await.unwrap());

    let proxy = RuntimeProxy::with_port(not_ready_port).unwrap();
    assert!(!proxy.health("127.0.0.1", timeout).await.unwrap());
}

#[tokio::test]
async fn eviction_under_pressure_keeps_the_two_newest_sandboxes() {
    let routes: Arc<RouteFn> = Arc::new(|path| match path {
        "/init" => Canned::json(200, r#"{"ok":true}"#),
        "/run" => Canned::json(200, r#"{"ok":1}"#),
        "/code" => Canned::json(200, "function main(){return {ok:1}}"),
        _ => Canned::json(404, "{}"),
    });
    let port = spawn_server(routes).await;

    let fake = FakeSubstrate::with_addr("127.0.0.1");
    let pool = SandboxPool::new(
        fake.clone(),
        PoolConfig {
            max_size: 2,
            idle_timeout: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(3600),
        },
    );
    let proxy = Arc::new(RuntimeProxy::with_port(port).unwrap());
    let collector = Arc::new(LogCollector::new(fake.clone()));
    let executor = Executor::new(pool.clone(), proxy, collector).unwrap();

    let code_url = format!("http://127.0.0.1:{}/code", port);
    for name in ["a", "b", "c"] {
        let mut msg = message(&code_url, 10_000, 5_000);
        msg.action.name = name.to_string();
        let result = executor.execute(&msg).await;
        assert_eq!(result.status_code, STATUS_SUCCESS);
    }

    // The sandbox for action `a` was least recently used when `c` came in.
    assert_eq!(fake.removed_ids(), vec!["sbx-1".to_string()]);
    assert_eq!(pool.stats().warm.values().sum::<usize>(), 2);
}
