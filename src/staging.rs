//! Local staging files, one per upload id.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncRead, AsyncReadExt as _, AsyncSeekExt as _},
};
use tracing::debug;

use crate::Chunk;

#[derive(Debug, Clone)]
pub struct StagingArea {
    directory: PathBuf,
}

impl StagingArea {
    /// Use `directory` for staging files, creating it if needed.
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self, Error> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|_| CreateDirSnafu {
                path: directory.to_string_lossy().to_string(),
            })?;
        Ok(Self { directory })
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.directory.join(id)
    }

    /// Create an empty staging file. Fails with [`Error::AlreadyExists`] rather
    /// than truncating a file that is already there.
    pub async fn allocate(&self, id: &str) -> Result<(), Error> {
        let path = self.path(id);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::AlreadyExists {
                path: path.to_string_lossy().to_string(),
            }),
            Err(e) => Err(Error::CreateFile {
                source: e,
                path: path.to_string_lossy().to_string(),
            }),
        }
    }

    /// Copy `reader` into the staging file starting at `offset` and flush it
    /// to disk. Returns the number of bytes written.
    pub async fn append_at<R>(&self, id: &str, offset: u64, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.path(id);
        let msg = path.to_string_lossy().to_string();

        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .with_context(|_| OpenSnafu { path: msg.clone() })?;
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|_| CopyDataSnafu { path: msg.clone() })?;
        let written = tokio::io::copy(reader, &mut file)
            .await
            .with_context(|_| CopyDataSnafu { path: msg.clone() })?;
        file.sync_data()
            .await
            .with_context(|_| CopyDataSnafu { path: msg })?;

        debug!("{} bytes written to {:?} at {}", written, &path, offset);
        Ok(written)
    }

    /// Size of the staging file.
    pub async fn stat(&self, id: &str) -> Result<u64, Error> {
        let path = self.path(id);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Missing {
                    path: path.to_string_lossy().to_string(),
                })
            }
            Err(e) => {
                return Err(Error::Stat {
                    source: e,
                    path: path.to_string_lossy().to_string(),
                })
            }
        };

        if !metadata.is_file() {
            return Err(Error::NotRegular {
                path: path.to_string_lossy().to_string(),
            });
        }
        Ok(metadata.len())
    }

    /// `len` bytes starting at `offset`, streamed from disk.
    pub async fn read_range(&self, id: &str, offset: u64, len: u64) -> Result<Chunk, Error> {
        let path = self.path(id);
        let mut file = File::open(&path).await.with_context(|_| OpenSnafu {
            path: path.to_string_lossy().to_string(),
        })?;
        file.seek(SeekFrom::Start(offset))
            .await
            .with_context(|_| OpenSnafu {
                path: path.to_string_lossy().to_string(),
            })?;
        Ok(Chunk::new(file.take(len), len))
    }

    /// Cut the staging file back to `len` bytes.
    pub async fn truncate(&self, id: &str, len: u64) -> Result<(), Error> {
        let path = self.path(id);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .with_context(|_| OpenSnafu {
                path: path.to_string_lossy().to_string(),
            })?;
        file.set_len(len).await.with_context(|_| TruncateSnafu {
            path: path.to_string_lossy().to_string(),
        })
    }

    /// Delete the staging file. A file that is already gone is not an error.
    pub async fn remove(&self, id: &str) -> Result<(), Error> {
        let path = self.path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Remove {
                source: e,
                path: path.to_string_lossy().to_string(),
            }),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create directory {}: {}", path, source))]
    CreateDir {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to create file {}: {}", path, source))]
    CreateFile {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("File {} already exists", path))]
    AlreadyExists { path: String },

    #[snafu(display("Failed to open file {}: {}", path, source))]
    Open {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to copy data to {}: {}", path, source))]
    CopyData {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to truncate {}: {}", path, source))]
    Truncate {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to stat {}: {}", path, source))]
    Stat {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("Failed to remove {}: {}", path, source))]
    Remove {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("No file at {}", path))]
    Missing { path: String },

    #[snafu(display("{} is not a regular file", path))]
    NotRegular { path: String },
}
