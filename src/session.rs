//! Upload session records and their persistence.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Extension field naming the remote destination path.
pub const REMOTE_DIR: &str = "remote_dir";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadLength {
    Known(u64),
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub length: UploadLength,
    pub received_offset: u64,
    pub metadata: String,
    pub extensions: BTreeMap<String, String>,
    pub remote_token: Option<String>,
    pub next_part_id: u64,
    pub required_part_size: Option<u64>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        id: String,
        length: UploadLength,
        metadata: String,
        extensions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            length,
            received_offset: 0,
            metadata,
            extensions,
            remote_token: None,
            next_part_id: 0,
            required_part_size: None,
            completed: false,
            created_at: Utc::now(),
        }
    }

    pub fn declared_length(&self) -> Option<u64> {
        match self.length {
            UploadLength::Known(len) => Some(len),
            UploadLength::Deferred => None,
        }
    }

    /// Remote destination of the object. Falls back to `/<id>` when the
    /// creator supplied none.
    pub fn remote_dir(&self) -> String {
        match self.extensions.get(REMOTE_DIR) {
            Some(dir) if !dir.is_empty() => dir.clone(),
            _ => format!("/{}", self.id),
        }
    }
}

/// Key/value persistence of sessions keyed by upload id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` for unknown ids.
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, Error>;

    /// Store a new record. Returns `false` without touching anything when the
    /// id is already taken.
    async fn insert(&self, session: &UploadSession) -> Result<bool, Error>;

    async fn set(&self, session: &UploadSession) -> Result<(), Error>;

    async fn remove(&self, id: &str) -> Result<(), Error>;
}

/// All records kept in a single JSON document, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, UploadSession>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading previously persisted records.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|_| WriteSnafu {
                    path: parent.to_string_lossy().to_string(),
                })?;
        }

        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|_| ParseSnafu {
                path: path.to_string_lossy().to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::Read {
                    source: e,
                    path: path.to_string_lossy().to_string(),
                })
            }
        };
        debug!("Loaded {} upload sessions from {:?}", records.len(), &path);

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &BTreeMap<String, UploadSession>) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(records).context(SerializeSnafu)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|_| WriteSnafu {
                path: tmp.to_string_lossy().to_string(),
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|_| WriteSnafu {
                path: self.path.to_string_lossy().to_string(),
            })
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, Error> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn insert(&self, session: &UploadSession) -> Result<bool, Error> {
        let mut records = self.records.lock().await;
        if records.contains_key(&session.id) {
            return Ok(false);
        }
        records.insert(session.id.clone(), session.clone());
        if let Err(e) = self.persist(&records).await {
            records.remove(&session.id);
            return Err(e);
        }
        Ok(true)
    }

    async fn set(&self, session: &UploadSession) -> Result<(), Error> {
        let mut records = self.records.lock().await;
        let previous = records.insert(session.id.clone(), session.clone());
        if let Err(e) = self.persist(&records).await {
            match previous {
                Some(previous) => records.insert(session.id.clone(), previous),
                None => records.remove(&session.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), Error> {
        let mut records = self.records.lock().await;
        if records.remove(id).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }
}

/// Process-local store; records are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, UploadSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<UploadSession>, Error> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn insert(&self, session: &UploadSession) -> Result<bool, Error> {
        let mut records = self.records.write().await;
        if records.contains_key(&session.id) {
            return Ok(false);
        }
        records.insert(session.id.clone(), session.clone());
        Ok(true)
    }

    async fn set(&self, session: &UploadSession) -> Result<(), Error> {
        self.records
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), Error> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read session store {}: {}", path, source))]
    Read {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to write session store {}: {}", path, source))]
    Write {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to parse session store {}: {}", path, source))]
    Parse {
        source: serde_json::Error,
        path: String,
    },

    #[snafu(display("Failed to serialize sessions: {}", source))]
    Serialize { source: serde_json::Error },
}
