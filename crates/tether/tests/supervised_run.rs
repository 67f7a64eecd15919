//! End-to-end runs against a supervising peer on a loopback socket.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use tether::bridge::codec::JsonCodec;
use tether::limits::{LimitKind, RawLimit};
use tether::{
    BootstrapConfig, ChannelConfig, ExecutionContext, Message, MessageType, ResourceLimiter,
    RlimitBackend, STATUS_LINE_PREFIX, Supervisor, Workload, WorkloadError, workload_fn,
};

/// Reports every limit as unlimited and accepts every change without touching
/// the test process.
struct UnlimitedRlimits;

impl RlimitBackend for UnlimitedRlimits {
    fn get(&self, _kind: LimitKind) -> io::Result<RawLimit> {
        Ok(RawLimit {
            soft: None,
            hard: None,
        })
    }

    fn set(&self, _kind: LimitKind, _soft: u64, _hard: Option<u64>) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Peer {
    reader: FramedRead<OwnedReadHalf, JsonCodec<Message>>,
    writer: FramedWrite<OwnedWriteHalf, JsonCodec<Message>>,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("bootstrap connected")
            .unwrap();
        let (r, w) = stream.into_split();
        Self {
            reader: FramedRead::new(r, JsonCodec::new()),
            writer: FramedWrite::new(w, JsonCodec::new()),
        }
    }

    async fn next(&mut self) -> Option<Message> {
        match tokio::time::timeout(Duration::from_secs(5), self.reader.next()).await {
            Ok(Some(Ok(m))) => Some(m),
            _ => None,
        }
    }

    async fn send(&mut self, kind: MessageType, payload: Value) {
        self.writer.send(Message::new(kind, payload)).await.unwrap();
    }

    /// Read until the bootstrap says goodbye or hangs up.
    async fn drain(&mut self) -> Vec<Message> {
        let mut seen = Vec::new();
        while let Some(m) = self.next().await {
            let done = m.kind() == &MessageType::Disconnect;
            seen.push(m);
            if done {
                break;
            }
        }
        seen
    }
}

fn fast_channel() -> ChannelConfig {
    ChannelConfig {
        connect_timeout: Duration::from_secs(2),
        receive_poll: Duration::from_millis(20),
        close_timeout: Duration::from_secs(2),
    }
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn supervisor(config: BootstrapConfig, workload: Arc<dyn Workload>) -> (Supervisor, Captured) {
    let out = Captured::default();
    let loader = move |_: &Path| -> anyhow::Result<Arc<dyn Workload>> { Ok(Arc::clone(&workload)) };
    let sup = Supervisor::new(config)
        .with_limiter(ResourceLimiter::new(Arc::new(UnlimitedRlimits)))
        .with_loader(Arc::new(loader))
        .with_status_writer(Box::new(out.clone()));
    (sup, out)
}

fn status_names(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.kind() == &MessageType::ScriptStatus)
        .map(|m| m.payload()["status"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_code_propagates_with_ordered_lifecycle() {
    let (listener, port) = listener().await;
    let script = tempfile::NamedTempFile::new().unwrap();
    let config = BootstrapConfig::new(script.path())
        .with_args(r#"{"job": "etl"}"#)
        .with_communication("127.0.0.1", port)
        .with_channel_config(fast_channel());
    let (sup, _out) = supervisor(
        config,
        workload_fn(|_ctx| async { Err(WorkloadError::exit(42)) }),
    );

    let run = tokio::spawn(sup.run());
    let mut peer = Peer::accept(&listener).await;
    let seen = peer.drain().await;

    assert_eq!(run.await.unwrap(), 42);

    assert_eq!(seen.first().unwrap().kind(), &MessageType::Connection);
    assert_eq!(seen.first().unwrap().payload()["pid"], std::process::id());
    assert_eq!(seen.last().unwrap().kind(), &MessageType::Disconnect);
    assert_eq!(status_names(&seen), ["loading", "executing", "exited"]);

    let loading = seen
        .iter()
        .find(|m| m.payload()["status"] == "loading")
        .unwrap();
    assert_eq!(loading.payload()["args"], json!({"job": "etl"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fault_reports_failed_and_exits_one() {
    let (listener, port) = listener().await;
    let script = tempfile::NamedTempFile::new().unwrap();
    let config = BootstrapConfig::new(script.path())
        .with_communication("127.0.0.1", port)
        .with_channel_config(fast_channel());
    let (sup, _out) = supervisor(
        config,
        workload_fn(|_ctx| async {
            Err(WorkloadError::Fault(anyhow::anyhow!("division by zero")))
        }),
    );

    let run = tokio::spawn(sup.run());
    let mut peer = Peer::accept(&listener).await;
    let seen = peer.drain().await;

    assert_eq!(run.await.unwrap(), 1);
    assert_eq!(status_names(&seen), ["loading", "executing", "failed"]);
    let failed = seen
        .iter()
        .find(|m| m.payload()["status"] == "failed")
        .unwrap();
    assert_eq!(failed.payload()["error"], "division by zero");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_target_never_connects() {
    let (listener, port) = listener().await;
    let config = BootstrapConfig::new("/missing/path")
        .with_communication("127.0.0.1", port)
        .with_channel_config(fast_channel());
    let (sup, out) = supervisor(config, workload_fn(|_ctx| async { Ok(()) }));

    assert_eq!(sup.run().await, 1);
    assert!(out.0.lock().unwrap().is_empty());

    let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "bootstrap should not have connected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workload_converses_with_supervisor() {
    let (listener, port) = listener().await;
    let script = tempfile::NamedTempFile::new().unwrap();
    let config = BootstrapConfig::new(script.path())
        .with_communication("127.0.0.1", port)
        .with_channel_config(fast_channel())
        .with_await_poll(Duration::from_millis(10));
    let (sup, out) = supervisor(
        config,
        workload_fn(|ctx: ExecutionContext| async move {
            ctx.logger("echo").info("waiting for input");
            match ctx.await_inbound(Duration::from_secs(5)).await {
                Some(input) => {
                    ctx.emit(json!({"echo": input})).await;
                    Ok(())
                }
                None => Err(WorkloadError::exit(9)),
            }
        }),
    );

    let run = tokio::spawn(sup.run());
    let mut peer = Peer::accept(&listener).await;

    // Heartbeat and commands are answered while the workload is blocked.
    peer.send(MessageType::Heartbeat, json!("ping")).await;
    peer.send(MessageType::Command, json!({"type": "reboot"})).await;
    peer.send(MessageType::Command, json!({"type": "status"})).await;
    peer.send(MessageType::Data, json!({"question": 6})).await;

    let seen = peer.drain().await;
    assert_eq!(run.await.unwrap(), 0);

    let kinds: Vec<&str> = seen.iter().map(|m| m.kind().as_str()).collect();
    assert!(kinds.contains(&"heartbeat_response"));

    let responses: Vec<&Message> = seen
        .iter()
        .filter(|m| m.kind() == &MessageType::CommandResponse)
        .collect();
    assert_eq!(responses.len(), 1, "unknown command must not be answered");
    assert_eq!(responses[0].payload()["type"], "status_response");

    let echo = seen
        .iter()
        .find(|m| m.kind().as_str() == "workload_data")
        .expect("workload emitted");
    assert_eq!(echo.payload()["data"]["echo"], json!({"question": 6}));
    assert_eq!(echo.payload()["source"], "workload");

    assert_eq!(status_names(&seen).last().unwrap(), "completed");

    let record = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    let json: Value =
        serde_json::from_str(record.trim_end().strip_prefix(STATUS_LINE_PREFIX).unwrap()).unwrap();
    assert_eq!(json["status"], "initialized");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_hanging_up_does_not_stop_workload() {
    let (listener, port) = listener().await;
    let script = tempfile::NamedTempFile::new().unwrap();
    let config = BootstrapConfig::new(script.path())
        .with_communication("127.0.0.1", port)
        .with_channel_config(fast_channel());
    let (sup, _out) = supervisor(
        config,
        workload_fn(|ctx: ExecutionContext| async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            while ctx.can_communicate() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if ctx.can_communicate() {
                return Err(WorkloadError::exit(5));
            }
            // Emitting after the peer left is a logged no-op.
            assert!(!ctx.emit(json!("late")).await);
            Ok(())
        }),
    );

    let run = tokio::spawn(sup.run());
    let peer = Peer::accept(&listener).await;
    drop(peer);

    assert_eq!(run.await.unwrap(), 0);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_workload_bridges_stdio() {
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
    writeln!(
        file,
        "#!/bin/sh\necho '{{\"stage\": \"started\"}}'\nread line\necho \"got $line\"\nexit 3"
    )
    .unwrap();
    file.flush().unwrap();
    let path = file.into_temp_path();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (listener, port) = listener().await;
    let config = BootstrapConfig::new(path.to_path_buf())
        .with_communication("127.0.0.1", port)
        .with_channel_config(fast_channel());
    let sup = Supervisor::new(config)
        .with_limiter(ResourceLimiter::new(Arc::new(UnlimitedRlimits)))
        .with_status_writer(Box::new(Captured::default()));

    let run = tokio::spawn(sup.run());
    let mut peer = Peer::accept(&listener).await;

    // Wait for the child's first line before answering it.
    loop {
        let m = peer.next().await.expect("stage message");
        if m.kind().as_str() == "workload_data" {
            assert_eq!(m.payload()["data"], json!({"stage": "started"}));
            break;
        }
    }
    peer.send(MessageType::Data, json!({"n": 1})).await;

    let seen = peer.drain().await;
    assert_eq!(run.await.unwrap(), 3);

    let reply = seen
        .iter()
        .find(|m| m.kind().as_str() == "workload_data")
        .expect("child echoed input");
    assert_eq!(reply.payload()["data"], json!(r#"got {"n":1}"#));
    assert_eq!(status_names(&seen).last().unwrap(), "exited");
}
