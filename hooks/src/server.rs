//! Per-session Unix socket server for hook events.
//!
//! One `HookServer` instance owns one socket file. Sidecar processes connect,
//! write newline-terminated JSON frames, and disconnect; frames are decoded
//! and re-broadcast to subscribers in arrival order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{paths, HookError, HookFrame, HookServerEvent, MAX_FRAME_BYTES};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Unix socket server receiving hook events for a single session.
///
/// Lifecycle: [`start`](HookServer::start) creates the sessions directory
/// (0700) and listens; [`stop`](HookServer::stop) closes the listener and
/// removes the socket file. `start` on an already-listening server is a
/// no-op returning success.
pub struct HookServer {
    session_id: String,
    socket_path: PathBuf,
    event_tx: broadcast::Sender<HookServerEvent>,
    running: Mutex<Option<Running>>,
}

impl HookServer {
    /// Create a server for `session_id` at the default socket location.
    pub fn new(session_id: impl Into<String>) -> Result<Self, HookError> {
        let session_id = session_id.into();
        let socket_path = paths::socket_path(&session_id)?;
        Ok(Self::with_socket_path(session_id, socket_path))
    }

    /// Create a server with an explicit socket path.
    pub fn with_socket_path(session_id: impl Into<String>, socket_path: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            session_id: session_id.into(),
            socket_path,
            event_tx,
            running: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Subscribe to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<HookServerEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|r| !r.task.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Bind the socket and begin accepting sidecar connections.
    pub fn start(&self) -> Result<(), HookError> {
        let mut guard = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(running) = guard.as_ref() {
            if !running.task.is_finished() {
                return Ok(());
            }
        }

        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent)?;
            paths::restrict_permissions(parent, 0o700);
        }
        // A stale socket from a crashed run blocks bind; clear it first.
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|source| HookError::BindFailed {
                path: self.socket_path.display().to_string(),
                source,
            })?;
        paths::restrict_permissions(&self.socket_path, 0o600);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.event_tx.clone(),
            cancel.clone(),
            self.session_id.clone(),
        ));
        *guard = Some(Running { cancel, task });

        debug!(
            session_id = %self.session_id,
            socket = %self.socket_path.display(),
            "hook server listening"
        );
        Ok(())
    }

    /// Stop accepting connections and remove the socket file.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.task.await;
        }
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for HookServer {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.running.lock() {
            if let Some(running) = guard.take() {
                running.cancel.cancel();
                running.task.abort();
            }
        }
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    event_tx: broadcast::Sender<HookServerEvent>,
    cancel: CancellationToken,
    session_id: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let _ = event_tx.send(HookServerEvent::ClientConnected);
                    tokio::spawn(client_loop(stream, event_tx.clone(), cancel.clone()));
                }
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "hook accept failed");
                    let _ = event_tx.send(HookServerEvent::Error(err.to_string()));
                }
            },
        }
    }
}

async fn client_loop(
    stream: UnixStream,
    event_tx: broadcast::Sender<HookServerEvent>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        // The cap keeps an unterminated stream from buffering without bound;
        // one extra byte leaves room for the LF of a maximum-size frame.
        let mut limited = (&mut reader).take(MAX_FRAME_BYTES as u64 + 1);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = limited.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    if buf.len() > MAX_FRAME_BYTES {
                        // Hit the cap before any LF: discard bytes up to the
                        // next frame boundary instead of buffering them.
                        let _ = event_tx.send(HookServerEvent::Error(format!(
                            "frame exceeds {MAX_FRAME_BYTES} bytes, dropped"
                        )));
                        let discarded = tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = discard_until_newline(&mut reader) => result,
                        };
                        match discarded {
                            Ok(true) => continue,
                            _ => break,
                        }
                    }
                    // EOF with a trailing partial line; frames are strictly
                    // LF-terminated, so it is dropped.
                    break;
                }

                buf.pop();
                if buf.last() == Some(&b'\r') {
                    // Strict LF framing: CRLF is not tolerated.
                    let _ = event_tx.send(HookServerEvent::Error(
                        "CRLF-terminated hook frame, dropped".to_string(),
                    ));
                    continue;
                }
                if buf.is_empty() {
                    continue;
                }

                let frame_text = match std::str::from_utf8(&buf) {
                    Ok(text) => text,
                    Err(err) => {
                        // Bad encoding drops the frame, not the connection.
                        let _ = event_tx.send(HookServerEvent::Error(format!(
                            "invalid UTF-8 in hook frame: {err}"
                        )));
                        continue;
                    }
                };

                match serde_json::from_str::<HookFrame>(frame_text) {
                    Ok(frame) => {
                        let data = serde_json::to_string(&frame.data)
                            .unwrap_or_else(|_| "{}".to_string());
                        let _ = event_tx.send(HookServerEvent::EventReceived {
                            event_type: frame.event_type,
                            data,
                        });
                    }
                    Err(err) => {
                        // Bad frames never close the connection.
                        let _ = event_tx
                            .send(HookServerEvent::Error(format!("invalid hook frame: {err}")));
                    }
                }
            }
            Err(err) => {
                let _ = event_tx.send(HookServerEvent::Error(err.to_string()));
                break;
            }
        }
    }

    let _ = event_tx.send(HookServerEvent::ClientDisconnected);
}

/// Consume and discard bytes up to and including the next LF.
///
/// Returns Ok(true) when a newline was found, Ok(false) on EOF. Used to
/// resynchronize after an oversized frame without buffering it.
async fn discard_until_newline(reader: &mut BufReader<UnixStream>) -> std::io::Result<bool> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(false);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                std::pin::Pin::new(&mut *reader).consume(pos + 1);
                return Ok(true);
            }
            None => {
                let len = available.len();
                std::pin::Pin::new(&mut *reader).consume(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn test_server(name: &str) -> (tempfile::TempDir, HookServer) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(format!("{name}.sock"));
        (dir, HookServer::with_socket_path(name, socket))
    }

    async fn recv_event(rx: &mut broadcast::Receiver<HookServerEvent>) -> HookServerEvent {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match rx.recv().await.unwrap() {
                    HookServerEvent::ClientConnected | HookServerEvent::ClientDisconnected => {}
                    other => return other,
                }
            }
        })
        .await
        .expect("no event within 1s")
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_dir, server) = test_server("idem");
        server.start().unwrap();
        server.start().unwrap();
        assert!(server.is_running());
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn stop_removes_socket_file() {
        let (_dir, server) = test_server("cleanup");
        server.start().unwrap();
        assert!(server.socket_path().exists());
        server.stop().await;
        assert!(!server.socket_path().exists());
    }

    #[tokio::test]
    async fn frame_is_received_and_rebroadcast() {
        let (_dir, server) = test_server("recv");
        server.start().unwrap();
        let mut rx = server.subscribe();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        stream
            .write_all(b"{\"event_type\":\"Stop\",\"data\":{}}\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();

        match recv_event(&mut rx).await {
            HookServerEvent::EventReceived { event_type, data } => {
                assert_eq!(event_type, "Stop");
                assert_eq!(data, "{}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let (_dir, server) = test_server("bad");
        server.start().unwrap();
        let mut rx = server.subscribe();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        stream.write_all(b"not valid json\n").await.unwrap();
        match recv_event(&mut rx).await {
            HookServerEvent::Error(_) => {}
            other => panic!("expected error event, got {other:?}"),
        }

        // Same connection still delivers a well-formed frame.
        stream
            .write_all(b"{\"event_type\":\"PreToolUse\",\"data\":{\"tool_name\":\"Bash\"}}\n")
            .await
            .unwrap();
        match recv_event(&mut rx).await {
            HookServerEvent::EventReceived { event_type, .. } => {
                assert_eq!(event_type, "PreToolUse");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn invalid_utf8_frame_keeps_connection_open() {
        let (_dir, server) = test_server("utf8");
        server.start().unwrap();
        let mut rx = server.subscribe();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        stream.write_all(b"\xff\xfe\xfd{\"x\":1}\n").await.unwrap();
        match recv_event(&mut rx).await {
            HookServerEvent::Error(message) => assert!(message.contains("UTF-8")),
            other => panic!("expected error event, got {other:?}"),
        }

        // The same connection still delivers a well-formed frame.
        stream
            .write_all(b"{\"event_type\":\"Stop\",\"data\":{}}\n")
            .await
            .unwrap();
        match recv_event(&mut rx).await {
            HookServerEvent::EventReceived { event_type, .. } => {
                assert_eq!(event_type, "Stop");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn crlf_frame_is_rejected() {
        let (_dir, server) = test_server("crlf");
        server.start().unwrap();
        let mut rx = server.subscribe();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        // Valid JSON, but CRLF-terminated: dropped, never decoded.
        stream
            .write_all(b"{\"event_type\":\"Stop\",\"data\":{}}\r\n")
            .await
            .unwrap();
        match recv_event(&mut rx).await {
            HookServerEvent::Error(message) => assert!(message.contains("CRLF")),
            other => panic!("expected error event, got {other:?}"),
        }

        stream
            .write_all(b"{\"event_type\":\"PreToolUse\",\"data\":{}}\n")
            .await
            .unwrap();
        match recv_event(&mut rx).await {
            HookServerEvent::EventReceived { event_type, .. } => {
                assert_eq!(event_type, "PreToolUse");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn oversized_unterminated_frame_is_discarded() {
        let (_dir, server) = test_server("oversized");
        server.start().unwrap();
        let mut rx = server.subscribe();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        // No LF anywhere in the first MAX_FRAME_BYTES+1 bytes: the reader
        // must bail at the cap rather than buffer the whole stream.
        let oversized = vec![b'a'; MAX_FRAME_BYTES + 10];
        stream.write_all(&oversized).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        match tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    HookServerEvent::Error(message) => return message,
                    HookServerEvent::EventReceived { .. } => panic!("oversized frame decoded"),
                    _ => continue,
                }
            }
        })
        .await
        {
            Ok(message) => assert!(message.contains("exceeds")),
            Err(_) => panic!("no error event for oversized frame"),
        }

        // Resynchronized at the newline; the next frame decodes normally.
        stream
            .write_all(b"{\"event_type\":\"Stop\",\"data\":{}}\n")
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let HookServerEvent::EventReceived { event_type, .. } =
                    rx.recv().await.unwrap()
                {
                    return event_type;
                }
            }
        })
        .await
        {
            Ok(event_type) => assert_eq!(event_type, "Stop"),
            Err(_) => panic!("no frame after resynchronization"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn frames_arrive_in_write_order() {
        let (_dir, server) = test_server("order");
        server.start().unwrap();
        let mut rx = server.subscribe();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        stream
            .write_all(
                b"{\"event_type\":\"PreToolUse\",\"data\":{}}\n\
                  {\"event_type\":\"PostToolUse\",\"data\":{}}\n\
                  {\"event_type\":\"Stop\",\"data\":{}}\n",
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            if let HookServerEvent::EventReceived { event_type, .. } = recv_event(&mut rx).await {
                seen.push(event_type);
            }
        }
        assert_eq!(seen, ["PreToolUse", "PostToolUse", "Stop"]);
        server.stop().await;
    }
}
