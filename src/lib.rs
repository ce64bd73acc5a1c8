use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub mod backend;
pub mod coordinator;
pub mod metadata;
pub mod probe;
pub mod session;
pub mod staging;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CreateRequest, Error, ErrorKind, UploadEvent, UploadStatus,
};
pub use session::{JsonFileStore, MemoryStore, SessionStore, UploadLength, UploadSession};

pub type BoxError = Box<dyn snafu::Error + Send + Sync>;

/// A run of upload bytes handed to a multipart backend.
/// The reader yields exactly `len` bytes.
pub struct Chunk {
    pub reader: Pin<Box<dyn AsyncRead + Send + Sync>>,
    pub len: u64,
}

impl Chunk {
    pub fn new(reader: impl AsyncRead + Send + Sync + 'static, len: u64) -> Self {
        Self {
            reader: Box::pin(reader),
            len,
        }
    }
}

/// Stage header sent with a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Upload,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Complete => "complete",
        }
    }
}

/// What the remote service handed back from an initiate call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Initiated {
    pub token: Option<String>,
    pub next_part_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRequest<'a> {
    pub token: Option<&'a str>,
    pub part_id: u64,
    pub part_size: Option<u64>,
    pub stage: Stage,
}

/// Acknowledgement of an accepted part. `next_part_id` is `None` when the
/// remote service expects no further parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartAck {
    pub next_part_id: Option<u64>,
    pub next_part_size: Option<u64>,
}

/// A multipart object store: initiate, upload parts in sequence, complete.
/// Implementations never retry; any failure is returned to the caller.
#[async_trait]
pub trait MultipartUploader: Send + Sync {
    async fn initiate(
        &self,
        dest: &str,
        length: Option<u64>,
        content_type: Option<&str>,
    ) -> Result<Initiated, BoxError>;

    async fn upload_part(
        &self,
        dest: &str,
        part: PartRequest<'_>,
        chunk: Chunk,
    ) -> Result<PartAck, BoxError>;

    async fn complete(&self, dest: &str, token: Option<&str>) -> Result<(), BoxError>;
}
