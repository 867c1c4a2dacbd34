//! Per-session working directories.
//!
//! Layout:
//!   {base_dir}/{session_id}/    bind-mounted into every execution of the session
//!
//! Directories are created on first use and never removed implicitly.
//! Files written by one execution are visible to the next execution of
//! the same session and to nobody else.
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SandboxError;

/// Longest accepted session identifier
const MAX_SESSION_ID_LEN: usize = 128;

/// Validated session identifier.
///
/// Only lowercase ASCII letters, digits, `-`, `_` and `.` (not leading) are
/// accepted. Identifiers are never rewritten, and with no uppercase letters
/// two distinct identifiers map to two distinct sibling directories even on
/// case-insensitive filesystems.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: &str) -> Result<Self, SandboxError> {
        if id.is_empty() {
            return Err(SandboxError::Resource("session id is empty".into()));
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(SandboxError::Resource(format!(
                "session id longer than {MAX_SESSION_ID_LEN} characters"
            )));
        }
        if id.starts_with('.') {
            return Err(SandboxError::Resource(format!(
                "session id '{id}' must not start with '.'"
            )));
        }
        let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c);
        if let Some(c) = id.chars().find(|c| !allowed(*c)) {
            return Err(SandboxError::Resource(format!(
                "session id '{id}' contains invalid character {c:?}"
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Fresh random identifier for callers that don't bring one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file found in a session directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionFile {
    /// Path relative to the session directory, `/`-separated
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Maps session identifiers to directories under one base path.
///
/// Safe to share across tasks. First-use creation is serialized per
/// session identifier; different sessions never wait on each other.
/// A session's lock entry only lives while someone holds or waits on it.
pub struct SessionDirs {
    base_dir: PathBuf,
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionDirs {
    /// A relative `base_dir` is resolved against the current directory now,
    /// so later working-directory changes don't move the sessions.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            base_dir: std::path::absolute(&base_dir).unwrap_or(base_dir),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Where a session lives, without touching the filesystem.
    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    /// Returns the session directory, creating it (and missing parents)
    /// on first use. Idempotent.
    pub async fn resolve(&self, session_id: &str) -> Result<PathBuf, SandboxError> {
        let id = SessionId::new(session_id)?;
        let dir = self.path_for(&id);

        let lease = self.creation_lock(&id);
        let _guard = lease.lock.lock().await;

        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => return Ok(dir),
            Ok(_) => {
                return Err(SandboxError::Resource(format!(
                    "{} exists and is not a directory",
                    dir.display()
                )))
            }
            Err(_) => {}
        }

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SandboxError::Resource(format!("cannot create {}: {e}", dir.display()))
        })?;
        open_permissions(&dir).await?;

        info!(session = %id, "Created session directory {}", dir.display());
        Ok(dir)
    }

    /// Regular files in the session directory, recursively, sorted by path.
    /// A session that was never used has no files.
    pub async fn list_files(&self, session_id: &str) -> Result<Vec<SessionFile>, SandboxError> {
        let id = SessionId::new(session_id)?;
        let root = self.path_for(&id);
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                SandboxError::Resource(format!("cannot read {}: {e}", dir.display()))
            })?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SandboxError::Resource(format!("cannot read {}: {e}", dir.display())))?
            {
                let path = entry.path();
                // symlink_metadata: links are listed as-is, never followed
                let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(path);
                } else if meta.is_file() {
                    let Ok(relative) = path.strip_prefix(&root) else {
                        continue;
                    };
                    files.push(SessionFile {
                        path: relative_display(relative),
                        size: meta.len(),
                        modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    });
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(session = %id, "Listed {} session files", files.len());
        Ok(files)
    }

    /// Reads a text file from the session directory.
    ///
    /// `relative` must stay inside the session directory, including after
    /// symlinks are resolved.
    pub async fn read_file(&self, session_id: &str, relative: &str) -> Result<String, SandboxError> {
        let id = SessionId::new(session_id)?;
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SandboxError::Resource(format!(
                "path traversal attempt detected: {relative}"
            )));
        }

        let root = self.path_for(&id);
        let candidate = root.join(rel);
        let (root, resolved) = match (
            tokio::fs::canonicalize(&root).await,
            tokio::fs::canonicalize(&candidate).await,
        ) {
            (Ok(root), Ok(resolved)) => (root, resolved),
            _ => {
                return Err(SandboxError::Resource(format!(
                    "file not found: {relative}"
                )))
            }
        };
        if !resolved.starts_with(&root) {
            return Err(SandboxError::Resource(format!(
                "path traversal attempt detected: {relative}"
            )));
        }

        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| SandboxError::Resource(format!("cannot read {relative}: {e}")))
    }

    /// Deletes a session directory and everything in it.
    ///
    /// Executors never call this; cleanup belongs to whoever owns the
    /// session. Returns whether there was anything to remove.
    pub async fn remove(&self, session_id: &str) -> Result<bool, SandboxError> {
        let id = SessionId::new(session_id)?;
        let dir = self.path_for(&id);

        let lease = self.creation_lock(&id);
        let _guard = lease.lock.lock().await;

        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
            SandboxError::Resource(format!("cannot remove {}: {e}", dir.display()))
        })?;
        info!(session = %id, "Removed session directory {}", dir.display());
        Ok(true)
    }

    fn creation_lock(&self, id: &SessionId) -> LockLease<'_> {
        let lock = self
            .locks()
            .entry(id.as_str().to_string())
            .or_default()
            .clone();
        LockLease {
            dirs: self,
            key: id.as_str().to_string(),
            lock,
        }
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.creation_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks().len()
    }
}

/// One task's handle on a session's creation lock. The map entry is
/// evicted when the last lease for that session goes away.
struct LockLease<'a> {
    dirs: &'a SessionDirs,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.dirs.locks();
        // The map's reference plus ours
        if locks
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2)
        {
            locks.remove(&self.key);
        }
    }
}

/// The container user is not the host user, so the session directory
/// must be writable by others for the bind mount to be usable.
#[cfg(unix)]
async fn open_permissions(dir: &Path) -> Result<(), SandboxError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
        .await
        .map_err(|e| SandboxError::Resource(format!("cannot chmod {}: {e}", dir.display())))
}

#[cfg(not(unix))]
async fn open_permissions(_dir: &Path) -> Result<(), SandboxError> {
    Ok(())
}

fn relative_display(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
