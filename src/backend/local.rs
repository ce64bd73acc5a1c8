use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio::fs::OpenOptions;
use tracing::debug;
use uuid::Uuid;

use crate::{BoxError, Chunk, Initiated, MultipartUploader, PartAck, PartRequest, Stage};

/// Folder holding parts of objects that are not complete yet.
const PENDING_DIR: &str = ".pending";

/// Multipart backend that stitches parts into files under a local folder.
#[derive(Debug, Clone)]
pub struct Local {
    folder: PathBuf,
}

impl Local {
    /// Create a new instance of the local backend.
    /// folder: The folder where the files will be stored.
    pub fn new(folder: PathBuf) -> Self {
        Self { folder }
    }

    fn target(&self, dest: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(dest.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.as_os_str().is_empty() {
            return Err(Error::InvalidPath {
                path: dest.to_string(),
            });
        }
        Ok(self.folder.join(relative))
    }

    fn pending(&self, token: Option<&str>) -> Result<PathBuf, Error> {
        let token = token.ok_or(Error::MissingToken)?;
        Uuid::parse_str(token).map_err(|_| Error::InvalidToken {
            token: token.to_string(),
        })?;
        Ok(self.folder.join(PENDING_DIR).join(token))
    }
}

#[async_trait]
impl MultipartUploader for Local {
    async fn initiate(
        &self,
        dest: &str,
        _length: Option<u64>,
        _content_type: Option<&str>,
    ) -> Result<Initiated, BoxError> {
        self.target(dest)?;
        let dir = self.folder.join(PENDING_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|_| CreateDirSnafu {
                msg: dir.to_string_lossy().to_string(),
            })?;

        let token = Uuid::new_v4().to_string();
        let path = dir.join(&token);
        tokio::fs::File::create(&path)
            .await
            .with_context(|_| CreateFileSnafu {
                msg: path.to_string_lossy().to_string(),
            })?;
        debug!("Initiated local multipart upload for {} as {}", dest, token);

        Ok(Initiated {
            token: Some(token),
            next_part_size: None,
        })
    }

    async fn upload_part(
        &self,
        dest: &str,
        part: PartRequest<'_>,
        mut chunk: Chunk,
    ) -> Result<PartAck, BoxError> {
        let path = self.pending(part.token)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .with_context(|_| CreateFileSnafu {
                msg: path.to_string_lossy().to_string(),
            })?;
        let copied = tokio::io::copy(&mut chunk.reader, &mut file)
            .await
            .with_context(|_| CopyDataSnafu {
                msg: path.to_string_lossy().to_string(),
            })?;
        if copied != chunk.len {
            return Err(Error::ShortChunk {
                expected: chunk.len,
                actual: copied,
            }
            .into());
        }
        debug!("Stored part {} of {} ({} bytes)", part.part_id, dest, copied);

        let next_part_id = match part.stage {
            Stage::Upload => Some(part.part_id + 1),
            Stage::Complete => None,
        };
        Ok(PartAck {
            next_part_id,
            next_part_size: None,
        })
    }

    async fn complete(&self, dest: &str, token: Option<&str>) -> Result<(), BoxError> {
        let pending = self.pending(token)?;
        let path = self.target(dest)?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|_| CreateDirSnafu {
                    msg: parent.to_string_lossy().to_string(),
                })?;
        }

        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|_| CreateFileSnafu {
                    msg: path.to_string_lossy().to_string(),
                })?;
        }

        tokio::fs::rename(&pending, &path)
            .await
            .with_context(|_| CopyDataSnafu {
                msg: path.to_string_lossy().to_string(),
            })?;
        debug!("Completed local multipart upload to {:?}", &path);

        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create directory {}: {}", msg, source))]
    CreateDir {
        source: tokio::io::Error,
        msg: String,
    },

    #[snafu(display("Failed to create file {}: {}", msg, source))]
    CreateFile {
        source: tokio::io::Error,
        msg: String,
    },

    #[snafu(display("Failed to copy data to {}: {}", msg, source))]
    CopyData {
        source: tokio::io::Error,
        msg: String,
    },

    #[snafu(display("Invalid Path: {}", path))]
    InvalidPath { path: String },

    #[snafu(display("No multipart token given"))]
    MissingToken,

    #[snafu(display("Unknown multipart token {}", token))]
    InvalidToken { token: String },

    #[snafu(display("Part ended early: expected {} bytes, got {}", expected, actual))]
    ShortChunk { expected: u64, actual: u64 },
}
