//! Filesystem locations for konsolai session data.
//!
//! Layout under the user data directory:
//!
//! ```text
//! <data-dir>/konsolai/
//!   sessions/<session-id>.sock   hook socket (one per live session)
//!   sessions/<session-id>.yolo   yolo sentinel (present while L1 is on)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::HookError;

/// Base directory for all konsolai state.
pub fn data_dir() -> Result<PathBuf, HookError> {
    dirs::data_dir()
        .map(|d| d.join("konsolai"))
        .ok_or(HookError::DataDirUnavailable)
}

/// Directory holding per-session sockets and sentinels.
pub fn sessions_dir() -> Result<PathBuf, HookError> {
    Ok(data_dir()?.join("sessions"))
}

/// Create the sessions directory (mode 0700) and return it.
pub fn ensure_sessions_dir() -> Result<PathBuf, HookError> {
    let dir = sessions_dir()?;
    fs::create_dir_all(&dir)?;
    restrict_permissions(&dir, 0o700);
    Ok(dir)
}

/// Socket path for a session id.
pub fn socket_path(session_id: &str) -> Result<PathBuf, HookError> {
    Ok(sessions_dir()?.join(format!("{session_id}.sock")))
}

/// The yolo sentinel lives next to the socket with the extension swapped.
pub fn yolo_sentinel_path(socket_path: &Path) -> PathBuf {
    let mut path = socket_path.to_path_buf();
    path.set_extension("yolo");
    path
}

/// Whether the yolo sentinel exists for the given socket.
///
/// Stat-then-read so a concurrent removal between the two calls still reads
/// as "inactive" rather than erroring.
pub fn yolo_sentinel_active(socket_path: &Path) -> bool {
    let sentinel = yolo_sentinel_path(socket_path);
    if !sentinel.exists() {
        return false;
    }
    fs::read(&sentinel).is_ok()
}

/// Best-effort permission tightening; ignored on platforms without POSIX modes.
pub fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mut perms = meta.permissions();
            perms.set_mode(mode);
            let _ = fs::set_permissions(path, perms);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}
