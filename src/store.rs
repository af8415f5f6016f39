//! File-backed session store.
//!
//! One JSON document per session under the data dir. Every mutation is
//! written to a temp file, fsynced, renamed over the old document and the
//! directory fsynced before the in-memory copy changes. A write that fails
//! before the rename leaves both untouched.

use crate::constants::{SESSION_FILE_EXT, SESSION_TMP_EXT};
use crate::types::{Message, RelayError, Result, Role, Session, SessionId, SessionSummary};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Sessions written by the earliest relay builds: a bare array of turns.
#[derive(Deserialize)]
struct LegacyTurn {
    role: String,
    content: String,
}

pub struct SessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    /// Opens (creating if needed) the data dir and loads every session in it.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut sessions = HashMap::new();
        let mut skipped = 0usize;
        let mut read_dir = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_FILE_EXT) {
                continue;
            }
            let id = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(SessionId::parse)
            {
                Some(id) => id,
                None => {
                    tracing::warn!("[💾] Skipping {}: not a valid session id", path.display());
                    skipped += 1;
                    continue;
                }
            };

            match Self::load_file(&path, &id).await {
                Ok(session) => {
                    sessions.insert(id, Arc::new(Mutex::new(session)));
                }
                Err(e) => {
                    tracing::warn!("[💾] Skipping unreadable session {}: {}", path.display(), e.inner);
                    skipped += 1;
                }
            }
        }

        tracing::info!(
            "[💾] Session store opened at {}: {} session(s) loaded, {} skipped",
            dir.display(),
            sessions.len(),
            skipped
        );

        Ok(Self {
            dir,
            sessions: RwLock::new(sessions),
        })
    }

    async fn load_file(path: &Path, id: &SessionId) -> Result<Session> {
        let raw = tokio::fs::read_to_string(path).await?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;

        if value.is_array() {
            let turns: Vec<LegacyTurn> = serde_json::from_value(value)?;
            let modified: DateTime<Utc> = match tokio::fs::metadata(path).await?.modified() {
                Ok(t) => t.into(),
                Err(_) => Utc::now(),
            };
            tracing::debug!("[💾] Loading legacy session file {}", path.display());
            return Ok(Self::from_legacy(id.clone(), turns, modified));
        }

        let session: Session = serde_json::from_value(value)?;
        if &session.id != id {
            return Err(RelayError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("file holds session '{}'", session.id),
            ))
            .into());
        }
        Ok(session)
    }

    fn from_legacy(id: SessionId, turns: Vec<LegacyTurn>, modified: DateTime<Utc>) -> Session {
        let mut session = Session::new(id);
        for turn in turns {
            let role = match turn.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    tracing::debug!("[💾] Dropping legacy turn with role '{}'", other);
                    continue;
                }
            };
            session.push(Message {
                role,
                content: turn.content,
                timestamp: modified,
            });
        }
        session.created_at = modified;
        session.updated_at = modified;
        session
    }

    pub async fn create(&self) -> Result<SessionId> {
        let id = SessionId::generate();
        let session = Session::new(id.clone());
        self.persist(&session).await?;

        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::info!("[💾] Created session {}", id);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        let handle = self.handle(id).await?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Most recently updated first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let handles: Vec<Arc<Mutex<Session>>> =
            self.sessions.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    /// Durably appends one message and returns the updated session.
    pub async fn append(&self, id: &str, message: Message) -> Result<Session> {
        let handle = self.handle(id).await?;
        let mut current = handle.lock().await;

        let mut next = current.clone();
        next.push(message);
        self.persist(&next).await?;

        *current = next.clone();
        tracing::debug!(
            "[💾] Session {} now has {} message(s)",
            next.id.short(),
            next.messages.len()
        );
        Ok(next)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn handle(&self, id: &str) -> Result<Arc<Mutex<Session>>> {
        let key = match SessionId::parse(id) {
            Some(k) => k,
            None => return Err(RelayError::SessionNotFound(id.to_string()).into()),
        };
        match self.sessions.read().await.get(&key) {
            Some(handle) => Ok(handle.clone()),
            None => Err(RelayError::SessionNotFound(id.to_string()).into()),
        }
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SESSION_FILE_EXT))
    }

    fn tmp_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SESSION_TMP_EXT))
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        let target = self.session_path(&session.id);
        let tmp = self.tmp_path(&session.id);

        if let Err(e) = Self::write_atomically(&tmp, &target, &bytes).await {
            tracing::error!("[💾] Failed to persist session {}: {}", session.id, e);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_atomically(tmp: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp, target).await?;
        Self::sync_dir(target).await
    }

    /// Makes the rename itself durable.
    #[cfg(unix)]
    async fn sync_dir(target: &Path) -> std::io::Result<()> {
        match target.parent() {
            Some(dir) => tokio::fs::File::open(dir).await?.sync_all().await,
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    async fn sync_dir(_target: &Path) -> std::io::Result<()> {
        Ok(())
    }
}
