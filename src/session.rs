use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::state::SessionState;

/// The recording files covered by the integrity hash set, in directory order.
const HASHED_FILES: [&str; 6] = [
    "keystrokes.log",
    "terminal.log",
    "timing.log",
    "websocket.log",
    "events.log",
    "commands.log",
];

/// Files demoted to owner read-only at finalization (the five recording
/// streams are demoted by the recorder itself).
const PROTECTED_FILES: [&str; 3] = ["metadata.json", "analysis.json", "commands.log"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Interrupted,
    Error,
}

/// The session record, serialized as `metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub candidate_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub output_dir: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hashes: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create base directory: {0}")]
    CreateBaseDir(#[source] std::io::Error),

    #[error("failed to create session directory: {0}")]
    CreateSessionDir(#[source] std::io::Error),

    #[error("failed to serialize metadata: {0}")]
    SerializeMetadata(#[source] serde_json::Error),

    #[error("failed to write metadata: {0}")]
    WriteMetadata(#[source] std::io::Error),

    #[error("failed to hash {name}: {source}")]
    HashFile {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no hash recorded for {0}")]
    NoRecordedHash(String),
}

/// Owns the session record and its directory.
///
/// The manager is the only writer of `metadata.json`. Finalization
/// (`complete` / `interrupted`) is idempotent: the first call hashes the
/// recording files, persists the terminal metadata, and demotes permissions;
/// later calls are no-ops.
pub struct SessionManager {
    session: Mutex<Session>,
    session_dir: PathBuf,
    state: Arc<SessionState>,
    finalized: AtomicBool,
}

impl SessionManager {
    /// Create the session directory under `base_dir` and write the initial
    /// metadata. The directory name is
    /// `<candidate>_<YYYY-MM-DD_HH-MM-SS>_<shortId>`, mode 0700 so the shell
    /// user cannot read the recordings.
    pub fn new(
        base_dir: &str,
        candidate_name: &str,
        reconnect_window: Duration,
    ) -> Result<Self, SessionError> {
        std::fs::create_dir_all(base_dir).map_err(SessionError::CreateBaseDir)?;

        let id: String = Uuid::new_v4().to_string().chars().take(8).collect();
        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let dir_name = format!("{candidate_name}_{timestamp}_{id}");
        let session_dir = Path::new(base_dir).join(dir_name);

        create_private_dir(&session_dir).map_err(SessionError::CreateSessionDir)?;

        let state = Arc::new(SessionState::new(reconnect_window));

        let mut metadata = Map::new();
        metadata.insert(
            "reconnect_token".into(),
            Value::from(state.reconnect_token()),
        );
        metadata.insert(
            "reconnect_window_seconds".into(),
            Value::from(reconnect_window.as_secs()),
        );

        let session = Session {
            id,
            candidate_name: candidate_name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            output_dir: session_dir.display().to_string(),
            status: SessionStatus::Active,
            file_hashes: None,
            metadata,
        };

        let manager = Self {
            session: Mutex::new(session),
            session_dir,
            state,
            finalized: AtomicBool::new(false),
        };
        manager.save_metadata()?;

        Ok(manager)
    }

    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.session_dir.join(name)
    }

    pub fn state(&self) -> Arc<SessionState> {
        Arc::clone(&self.state)
    }

    /// Set a free-form metadata key. Not persisted until the next save.
    pub fn set_metadata(&self, key: &str, value: Value) {
        self.session.lock().metadata.insert(key.to_string(), value);
    }

    /// Stamp the session end instant and persist, without changing status.
    ///
    /// Called once recording stops so that post-session analysis reads a real
    /// duration before the final metadata write.
    pub fn record_end_time(&self) -> Result<(), SessionError> {
        {
            let mut session = self.session.lock();
            let end = Utc::now();
            session.duration_seconds =
                Some((end - session.start_time).num_milliseconds() as f64 / 1000.0);
            session.end_time = Some(end);
        }
        self.save_metadata()
    }

    /// Finalize with status `completed`.
    pub fn complete(&self) -> Result<(), SessionError> {
        self.finalize(SessionStatus::Completed)
    }

    /// Finalize with status `interrupted`, annotating the delivering signal.
    pub fn interrupted(&self, signal: &str) -> Result<(), SessionError> {
        self.set_metadata("interrupted", Value::from(true));
        self.set_metadata("signal", Value::from(signal));
        self.finalize(SessionStatus::Interrupted)
    }

    /// Mark the session as errored and persist. Does not hash or protect
    /// files; an errored session is left writable for post-mortem.
    pub fn error(&self, error: &str) -> Result<(), SessionError> {
        {
            let mut session = self.session.lock();
            session.status = SessionStatus::Error;
            session.metadata.insert("error".into(), Value::from(error));
        }
        self.save_metadata()
    }

    fn finalize(&self, status: SessionStatus) -> Result<(), SessionError> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let hashes = self.hash_recorded_files()?;
        {
            let mut session = self.session.lock();
            session.status = status;
            let end = Utc::now();
            session.duration_seconds =
                Some((end - session.start_time).num_milliseconds() as f64 / 1000.0);
            session.end_time = Some(end);
            session.file_hashes = Some(hashes);
        }
        self.save_metadata()?;

        for name in PROTECTED_FILES {
            let path = self.file_path(name);
            if path.exists() {
                if let Err(e) = set_owner_read_only(&path) {
                    tracing::warn!(file = name, error = %e, "could not protect session file");
                }
            }
        }

        tracing::info!(?status, "session files finalized and protected");
        Ok(())
    }

    /// SHA-256 every recording file that exists. Missing files are skipped so
    /// the hash map only covers what was actually captured.
    fn hash_recorded_files(&self) -> Result<BTreeMap<String, String>, SessionError> {
        let mut hashes = BTreeMap::new();
        for name in HASHED_FILES {
            let path = self.file_path(name);
            if !path.exists() {
                continue;
            }
            let digest = hash_file(&path).map_err(|source| SessionError::HashFile {
                name: name.to_string(),
                source,
            })?;
            hashes.insert(name.to_string(), digest);
        }
        Ok(hashes)
    }

    /// Re-hash a recorded file and compare against the digest captured at
    /// finalization.
    pub fn verify_file_hash(&self, name: &str) -> Result<bool, SessionError> {
        let expected = {
            let session = self.session.lock();
            session
                .file_hashes
                .as_ref()
                .and_then(|hashes| hashes.get(name).cloned())
                .ok_or_else(|| SessionError::NoRecordedHash(name.to_string()))?
        };
        let actual = hash_file(&self.file_path(name)).map_err(|source| SessionError::HashFile {
            name: name.to_string(),
            source,
        })?;
        Ok(actual == expected)
    }

    /// Persist the current session record as `metadata.json` (mode 0600).
    ///
    /// Failures here are fatal to the session; they indicate an unrecoverable
    /// disk condition.
    fn save_metadata(&self) -> Result<(), SessionError> {
        let data = {
            let session = self.session.lock();
            serde_json::to_vec_pretty(&*session).map_err(SessionError::SerializeMetadata)?
        };

        let path = self.file_path("metadata.json");
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path).map_err(SessionError::WriteMetadata)?;
        file.write_all(&data).map_err(SessionError::WriteMetadata)?;
        Ok(())
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

fn set_owner_read_only(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(path, perms)
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
