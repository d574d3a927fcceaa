//! konsolai-hook - Claude hook sidecar
//!
//! Invoked by Claude Code hooks to forward lifecycle events to the owning
//! konsolai session. Reads the event payload from stdin (JSON), augments it
//! with the session id and working directory from the environment, and writes
//! a single newline-terminated frame to the session's Unix socket.
//!
//! Exit codes: 0 = ok, 1 = bad arguments, 2 = connect failure, 3 = write
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use konsolai_hooks::{paths, HookFrame, SESSION_ID_ENV};

#[derive(Parser, Debug)]
#[command(
    name = "konsolai-hook",
    version,
    about = "Claude hook sidecar for konsolai"
)]
struct Args {
    /// Path to the konsolai session socket
    #[arg(short, long)]
    socket: PathBuf,

    /// Event type (Stop, Notification, PreToolUse, PostToolUse, ...)
    #[arg(short, long)]
    event: String,

    /// Connection timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let mut stdin_data = Vec::new();
    let _ = tokio::io::stdin().read_to_end(&mut stdin_data).await;

    let mut data = serde_json::from_slice::<serde_json::Value>(&stdin_data)
        .ok()
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::json!({}));

    // L1 pre-approval: the owning session drops a sentinel next to the socket
    // while auto-approve is on, letting us answer without a round-trip.
    if args.event == "PermissionRequest" && paths::yolo_sentinel_active(&args.socket) {
        data["yolo_approved"] = serde_json::Value::Bool(true);
    }

    let session_id = std::env::var(SESSION_ID_ENV).unwrap_or_default();
    let working_dir = std::env::var("PWD").unwrap_or_default();
    data["session_id"] = serde_json::Value::String(session_id.clone());
    data["working_dir"] = serde_json::Value::String(working_dir.clone());

    let mut frame = HookFrame::new(&args.event, data);
    frame.session_id = session_id;
    frame.working_dir = working_dir;

    let line = match frame.to_wire_line() {
        Ok(line) => line,
        Err(err) => {
            eprintln!("Error: failed to encode hook frame: {err}");
            return ExitCode::from(3);
        }
    };

    let wait = Duration::from_millis(args.timeout);
    let mut stream = match timeout(wait, UnixStream::connect(&args.socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            eprintln!("Error: failed to connect to konsolai socket: {err}");
            return ExitCode::from(2);
        }
        Err(_) => {
            eprintln!("Error: timed out connecting to konsolai socket");
            return ExitCode::from(2);
        }
    };

    let write = async {
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    match timeout(wait, write).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            eprintln!("Error: failed to write to konsolai socket: {err}");
            ExitCode::from(3)
        }
        Err(_) => {
            eprintln!("Error: timed out writing to konsolai socket");
            ExitCode::from(3)
        }
    }
}
