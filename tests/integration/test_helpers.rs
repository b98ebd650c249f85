//! Shared test helpers for registry- and API-level integration tests.
//!
//! Provides an in-memory kernel that speaks the gateway's NDJSON protocol
//! over duplex pipes, a [`FakeLauncher`] that starts it, and builders for
//! registries and `AppState`, so individual test modules can focus on
//! behaviour rather than boilerplate.
//!
//! The fake kernel interprets a tiny command language instead of Python:
//!
//! | code            | behaviour                                          |
//! |-----------------|----------------------------------------------------|
//! | `1+1`           | `execute_result` with `text/plain` `2`             |
//! | `print('x')`    | stdout stream `x\n`                                |
//! | `name = value`  | stores `value`; a later bare `name` echoes it      |
//! | `raise ...`     | `error` `ValueError: boom` with a coloured traceback |
//! | `display`       | one `display_data` bundle                          |
//! | `stderr`        | stderr stream `warning\n`                          |
//! | `twice`         | two `execute_result` messages                      |
//! | `garbage`       | a malformed line, then `execute_result` `survived` |
//! | `sleep`         | stays busy until `interrupt_request`               |
//! | `hang`          | stays busy and ignores interrupts                  |
//! | `die`           | closes its output mid-execution                    |
//! | `quit`          | finishes normally, then exits                      |
//!
//! Every execution is preceded by stale messages (another request's output
//! and an unparented idle) that the gateway must discard.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use kernel_gateway::api::handlers::AppState;
use kernel_gateway::api::server::serve_on;
use kernel_gateway::config::{GlobalConfig, InterruptMode, SessionTimeouts};
use kernel_gateway::kernel::launcher::KernelLauncher;
use kernel_gateway::kernel::spawner::KernelConnection;
use kernel_gateway::models::session::SessionState;
use kernel_gateway::orchestrator::registry::{RegistryConfig, SessionRegistry};
use kernel_gateway::orchestrator::session::KernelSession;
use kernel_gateway::{AppError, Result};

/// Kernel that announces itself and runs the command language above.
pub const FAKE: &str = "fake";
/// Kernel that never announces itself but otherwise behaves like [`FAKE`].
pub const SILENT: &str = "silent";
/// Kernel whose output closes before it signals readiness.
pub const STILLBORN: &str = "stillborn";
/// Kernel spec whose launch always fails.
pub const BROKEN: &str = "broken";

/// Launcher for in-memory fake kernels.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
}

impl FakeLauncher {
    /// Number of launch attempts so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl KernelLauncher for FakeLauncher {
    fn launch<'a>(
        &'a self,
        kernel_name: &'a str,
        _session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<KernelConnection>> + Send + 'a>> {
        Box::pin(async move {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if kernel_name == BROKEN {
                return Err(AppError::Transport(
                    "failed to spawn kernel: no such program".into(),
                ));
            }
            Ok(fake_connection(kernel_name))
        })
    }

    fn has_kernel(&self, kernel_name: &str) -> bool {
        matches!(kernel_name, FAKE | SILENT | STILLBORN | BROKEN)
    }
}

/// Start a fake kernel task and return the gateway's end of its pipes.
pub fn fake_connection(kernel_name: &str) -> KernelConnection {
    let (gateway, kernel) = tokio::io::duplex(1 << 16);
    let (gateway_reader, gateway_writer) = tokio::io::split(gateway);
    let (kernel_reader, kernel_writer) = tokio::io::split(kernel);

    let announce = kernel_name == FAKE;
    let stillborn = kernel_name == STILLBORN;
    tokio::spawn(async move {
        if stillborn {
            return;
        }
        let _ = run_fake_kernel(announce, BufReader::new(kernel_reader), kernel_writer).await;
    });

    KernelConnection {
        reader: Box::new(gateway_reader),
        writer: Box::new(gateway_writer),
        process: None,
        interrupt_mode: InterruptMode::Message,
    }
}

/// Timeouts short enough for tests but long enough for a loaded CI box.
pub fn test_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        startup: Duration::from_secs(2),
        execute: Duration::from_secs(5),
        interrupt_grace: Duration::from_secs(2),
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Build a registry over a fresh [`FakeLauncher`].
pub fn fake_registry(max_sessions: usize) -> (Arc<SessionRegistry>, Arc<FakeLauncher>) {
    fake_registry_with(max_sessions, test_timeouts())
}

/// Build a registry over a fresh [`FakeLauncher`] with custom timeouts.
pub fn fake_registry_with(
    max_sessions: usize,
    timeouts: SessionTimeouts,
) -> (Arc<SessionRegistry>, Arc<FakeLauncher>) {
    let launcher = Arc::new(FakeLauncher::default());
    let registry = SessionRegistry::new(
        Arc::clone(&launcher) as Arc<dyn KernelLauncher>,
        RegistryConfig {
            default_kernel: FAKE.into(),
            max_sessions,
            timeouts,
        },
    );
    (Arc::new(registry), launcher)
}

/// Serve the API over `registry` on an ephemeral port.
///
/// Returns the base URL; cancel the token to stop the server.
pub async fn spawn_api(registry: Arc<SessionRegistry>) -> (String, CancellationToken) {
    let config = GlobalConfig::from_toml_str("").expect("default config");
    let state = Arc::new(AppState {
        config: Arc::new(config),
        registry,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");

    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let _ = serve_on(listener, state, server_ct).await;
    });

    (format!("http://{addr}"), ct)
}

/// Poll until `session` reaches `state`, panicking after two seconds.
pub async fn wait_for_state(session: &KernelSession, state: SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.state() != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never reached {state:?}, stuck in {:?}",
            session.state()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Fake kernel ───────────────────────────────────────────────────────────────

fn wire(parent: Option<&str>, msg_type: &str, content: Value) -> String {
    let parent_header = parent.map_or_else(|| json!({}), |id| json!({ "msg_id": id }));
    let mut line = json!({
        "channel": "iopub",
        "header": {
            "msg_id": uuid::Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "session": "fake",
            "username": "fake-kernel",
            "date": "",
            "version": "5.3",
        },
        "parent_header": parent_header,
        "metadata": {},
        "content": content,
    })
    .to_string();
    line.push('\n');
    line
}

fn status(parent: Option<&str>, state: &str) -> String {
    wire(parent, "status", json!({ "execution_state": state }))
}

fn result(parent: &str, text: &str) -> String {
    wire(
        Some(parent),
        "execute_result",
        json!({ "data": { "text/plain": text }, "metadata": {} }),
    )
}

fn stream(parent: &str, name: &str, text: &str) -> String {
    wire(Some(parent), "stream", json!({ "name": name, "text": text }))
}

fn error(parent: &str, name: &str, value: &str, traceback: &[&str]) -> String {
    wire(
        Some(parent),
        "error",
        json!({ "ename": name, "evalue": value, "traceback": traceback }),
    )
}

async fn emit<W: AsyncWrite + Unpin>(out: &mut W, lines: &[String]) -> std::io::Result<()> {
    for line in lines {
        out.write_all(line.as_bytes()).await?;
    }
    out.flush().await
}

#[derive(Debug, PartialEq)]
enum Mode {
    Ready,
    /// Waiting for an interrupt to finish the given request.
    Sleeping(String),
    /// Ignoring everything but shutdown.
    Hung,
}

async fn run_fake_kernel<R, W>(announce: bool, input: R, mut out: W) -> std::io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if announce {
        emit(&mut out, &[status(None, "starting"), status(None, "idle")]).await?;
    }

    let mut variables: HashMap<String, String> = HashMap::new();
    let mut mode = Mode::Ready;
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let msg_type = request["header"]["msg_type"].as_str().unwrap_or_default();
        let msg_id = request["header"]["msg_id"]
            .as_str()
            .unwrap_or_default()
            .to_owned();

        match msg_type {
            "shutdown_request" => return Ok(()),
            "interrupt_request" => {
                if let Mode::Sleeping(parent) = &mode {
                    let parent = parent.clone();
                    emit(
                        &mut out,
                        &[
                            error(&parent, "KeyboardInterrupt", "", &["KeyboardInterrupt"]),
                            status(Some(&parent), "idle"),
                        ],
                    )
                    .await?;
                    mode = Mode::Ready;
                }
            }
            "execute_request" if mode == Mode::Ready => {
                let code = request["content"]["code"].as_str().unwrap_or_default().trim();
                emit(
                    &mut out,
                    &[
                        stream("an-earlier-request", "stdout", "stale"),
                        status(None, "idle"),
                        status(Some(&msg_id), "busy"),
                        wire(Some(&msg_id), "execute_input", json!({ "code": code })),
                    ],
                )
                .await?;

                match code {
                    "die" => return Ok(()),
                    "sleep" => {
                        mode = Mode::Sleeping(msg_id);
                        continue;
                    }
                    "hang" => {
                        mode = Mode::Hung;
                        continue;
                    }
                    _ => {}
                }

                let outputs = run_command(code, &msg_id, &mut variables, &mut out).await?;
                emit(&mut out, &outputs).await?;
                emit(&mut out, &[status(Some(&msg_id), "idle")]).await?;

                if code == "quit" {
                    return Ok(());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

async fn run_command<W: AsyncWrite + Unpin>(
    code: &str,
    parent: &str,
    variables: &mut HashMap<String, String>,
    out: &mut W,
) -> std::io::Result<Vec<String>> {
    let outputs = match code {
        "1+1" => vec![result(parent, "2")],
        "display" => vec![wire(
            Some(parent),
            "display_data",
            json!({
                "data": { "text/plain": "<Figure>", "image/png": "iVBORw0KGgo=" },
                "metadata": { "image/png": { "width": 640 } },
            }),
        )],
        "stderr" => vec![stream(parent, "stderr", "warning\n")],
        "twice" => vec![result(parent, "first"), result(parent, "second")],
        "garbage" => {
            out.write_all(b"this is not json\n").await?;
            vec![result(parent, "survived")]
        }
        _ if code.starts_with("raise") => vec![error(
            parent,
            "ValueError",
            "boom",
            &[
                "\u{1b}[0;31mTraceback (most recent call last)\u{1b}[0m",
                "  File \"<cell-1>\", line 1",
                "\u{1b}[0;31mValueError\u{1b}[0m: boom",
            ],
        )],
        _ if code.starts_with("print(") => {
            let inner = code
                .trim_start_matches("print(")
                .trim_end_matches(')')
                .trim_matches(|c| c == '\'' || c == '"');
            vec![stream(parent, "stdout", &format!("{inner}\n"))]
        }
        _ => match code.split_once(" = ") {
            Some((name, value)) => {
                variables.insert(name.trim().to_owned(), value.trim().to_owned());
                Vec::new()
            }
            None => variables
                .get(code)
                .map(|value| vec![result(parent, value)])
                .unwrap_or_default(),
        },
    };
    Ok(outputs)
}
