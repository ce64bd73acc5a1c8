//! Resumable upload coordinator.
//!
//! Ties the session store, the staging files and a multipart backend
//! together. Offset policy: a write must claim exactly the recorded offset of
//! its session, anything else is rejected with [`Error::OffsetMismatch`].
//! Bytes a failed write left in the staging file are truncated away, so the
//! staging file size matches the recorded offset whenever no write is running.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use tokio::{
    io::AsyncRead,
    sync::{broadcast, OwnedMutexGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    metadata,
    probe::{self, DurationProbe},
    session::{self, SessionStore, UploadLength, UploadSession},
    staging::{self, StagingArea},
    BoxError, MultipartUploader, PartRequest, Stage,
};

/// Longest media accepted, in whole minutes.
pub const MAX_DURATION_MINUTES: u64 = 15;

const ID_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Where staging files live.
    pub directory: PathBuf,
    #[serde(default = "default_max_duration")]
    pub max_duration_minutes: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_duration() -> u64 {
    MAX_DURATION_MINUTES
}

fn default_event_capacity() -> usize {
    64
}

impl CoordinatorConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_duration_minutes: default_max_duration(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub length: Option<u64>,
    pub defer_length: bool,
    pub metadata: String,
    pub extensions: BTreeMap<String, String>,
}

/// Notifications for whoever cares about upload progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Created(UploadSession),
    Completed(UploadSession),
}

/// Answer to a status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStatus {
    pub id: String,
    /// Bytes confirmed by the remote relay.
    pub received_offset: u64,
    /// Bytes present in the staging file right now.
    pub local_size: u64,
    pub length: UploadLength,
    pub metadata: String,
    pub extensions: BTreeMap<String, String>,
    pub completed: bool,
}

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Held while a session is being mutated. Dropping the last guard of a
/// session also drops its map entry.
struct SessionGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if locks
            .get(&self.id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    uploader: Arc<dyn MultipartUploader>,
    probe: Arc<dyn DurationProbe>,
    locks: Arc<Mutex<LockMap>>,
    events: broadcast::Sender<UploadEvent>,
    max_duration_minutes: u64,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("staging", &self.staging)
            .field("max_duration_minutes", &self.max_duration_minutes)
            .finish()
    }
}

impl Coordinator {
    pub async fn new(
        config: CoordinatorConfig,
        store: Arc<dyn SessionStore>,
        uploader: Arc<dyn MultipartUploader>,
        probe: Arc<dyn DurationProbe>,
    ) -> Result<Self, Error> {
        let staging = StagingArea::open(&config.directory)
            .await
            .context(StorageWriteSnafu { id: "" })?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            store,
            staging,
            uploader,
            probe,
            locks: Arc::new(Mutex::new(HashMap::new())),
            events,
            max_duration_minutes: config.max_duration_minutes,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Start a new upload: staging file, session record, remote multipart
    /// session, in that order.
    pub async fn create(&self, request: CreateRequest) -> Result<UploadSession, Error> {
        let length = match (request.length, request.defer_length) {
            (Some(len), _) => UploadLength::Known(len),
            (None, true) => UploadLength::Deferred,
            (None, false) => {
                return InvalidLengthSnafu {
                    detail: "neither a length nor a deferred length was given",
                }
                .fail()
            }
        };

        let mut session = self
            .register(length, request.metadata, request.extensions)
            .await?;
        let id = session.id.clone();

        let hint = metadata::extension_hint(&session.metadata);
        let initiated = self
            .uploader
            .initiate(
                &session.remote_dir(),
                session.declared_length(),
                metadata::content_type(&hint),
            )
            .await
            .context(RemoteWriteSnafu {
                id: id.as_str(),
                stage: "initiate",
            })?;

        session.remote_token = initiated.token;
        session.required_part_size = initiated.next_part_size;
        self.store
            .set(&session)
            .await
            .context(StoreSnafu { id: id.as_str() })?;

        info!("Created upload {} ({:?}) -> {}", id, session.length, session.remote_dir());
        let _ = self.events.send(UploadEvent::Created(session.clone()));
        Ok(session)
    }

    /// Mint an id, allocate its staging file and persist the record.
    async fn register(
        &self,
        length: UploadLength,
        metadata: String,
        extensions: BTreeMap<String, String>,
    ) -> Result<UploadSession, Error> {
        for _ in 0..ID_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            if self.stored(&id).await?.is_some() {
                continue;
            }

            match self.staging.allocate(&id).await {
                Ok(()) => {}
                Err(staging::Error::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e).context(StorageWriteSnafu { id: id.as_str() }),
            }

            let session = UploadSession::new(id.clone(), length, metadata.clone(), extensions.clone());
            match self.store.insert(&session).await {
                Ok(true) => return Ok(session),
                Ok(false) => self.discard_staging(&id).await,
                Err(e) => {
                    self.discard_staging(&id).await;
                    return Err(e).context(StoreSnafu { id: id.as_str() });
                }
            }
        }

        IdentifierGenerationFailedSnafu {
            attempts: ID_ATTEMPTS,
        }
        .fail()
    }

    /// Accept the bytes of `reader` at `offset`. Resolves with the new offset
    /// once the chunk is on disk and confirmed by the remote service.
    pub async fn write<R>(&self, id: &str, offset: u64, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.session(id).await?;
        let _guard = self.lock(id)?;
        let mut session = self.session(id).await?;

        ensure!(!session.completed, CompletedSnafu { id });
        ensure!(
            offset == session.received_offset,
            OffsetMismatchSnafu {
                id,
                claimed: offset,
                expected: session.received_offset,
            }
        );

        let written = match self.staging.append_at(id, offset, reader).await {
            Ok(written) => written,
            Err(e) => {
                self.rollback(id, offset).await;
                return Err(e).context(StorageWriteSnafu { id });
            }
        };

        match self.relay(&mut session, offset, written).await {
            Ok(new_offset) => Ok(new_offset),
            Err(e) => {
                self.rollback(id, offset).await;
                Err(e)
            }
        }
    }

    /// Everything after the chunk reached the staging file. Bookkeeping is
    /// persisted only after the remote service confirmed the chunk.
    async fn relay(
        &self,
        session: &mut UploadSession,
        offset: u64,
        written: u64,
    ) -> Result<u64, Error> {
        let id = session.id.clone();
        let new_offset = offset + written;

        if let Some(total) = session.declared_length() {
            ensure!(
                new_offset <= total,
                InvalidLengthSnafu {
                    detail: format!("chunk ends at {new_offset}, past the declared length {total}"),
                }
            );
        }
        let finished = session.declared_length() == Some(new_offset);
        if written == 0 && !finished {
            return Ok(offset);
        }

        if session.next_part_id == 0 {
            self.check_duration(&id).await?;
        }

        let dest = session.remote_dir();
        let stage = if finished { Stage::Complete } else { Stage::Upload };
        let chunk = self
            .staging
            .read_range(&id, offset, written)
            .await
            .context(StorageWriteSnafu { id: id.as_str() })?;
        let ack = self
            .uploader
            .upload_part(
                &dest,
                PartRequest {
                    token: session.remote_token.as_deref(),
                    part_id: session.next_part_id,
                    part_size: session.required_part_size,
                    stage,
                },
                chunk,
            )
            .await
            .context(RemoteWriteSnafu {
                id: id.as_str(),
                stage: stage.as_str(),
            })?;

        match ack.next_part_id {
            Some(next) => session.next_part_id = next,
            None => {
                self.uploader
                    .complete(&dest, session.remote_token.as_deref())
                    .await
                    .context(RemoteWriteSnafu {
                        id: id.as_str(),
                        stage: "complete",
                    })?;
                session.completed = true;
                if session.length == UploadLength::Deferred {
                    session.length = UploadLength::Known(new_offset);
                }
            }
        }
        session.received_offset = new_offset;
        if ack.next_part_size.is_some() {
            session.required_part_size = ack.next_part_size;
        }

        self.store
            .set(session)
            .await
            .context(StoreSnafu { id: id.as_str() })?;
        debug!("Upload {} is now {} bytes", id, new_offset);

        if session.completed {
            info!("Upload {} complete ({} bytes)", id, new_offset);
            let _ = self.events.send(UploadEvent::Completed(session.clone()));
        } else if finished {
            warn!(
                "Upload {} reached its length but the remote expects part {}",
                id, session.next_part_id
            );
        }
        Ok(new_offset)
    }

    async fn check_duration(&self, id: &str) -> Result<(), Error> {
        let Some(duration) = self.probe.duration(&self.staging.path(id)).await else {
            return Ok(());
        };
        ensure!(
            !probe::exceeds_limit(duration, self.max_duration_minutes),
            ContentPolicyViolationSnafu {
                id,
                minutes: duration.as_secs() / 60,
                limit: self.max_duration_minutes,
            }
        );
        Ok(())
    }

    /// Current state of an upload for polling clients.
    pub async fn get_offset(&self, id: &str) -> Result<UploadStatus, Error> {
        let session = self.session(id).await?;

        let local_size = match self.staging.stat(id).await {
            Ok(size) => size,
            Err(staging::Error::Missing { path }) => {
                warn!("No file found at {} but a session record exists", path);
                return FileGoneSnafu { id }.fail();
            }
            Err(staging::Error::NotRegular { path }) => {
                warn!("{} is not a regular file", path);
                return NotFoundSnafu { id }.fail();
            }
            Err(e) => return Err(e).context(StorageWriteSnafu { id }),
        };

        Ok(UploadStatus {
            id: session.id,
            received_offset: session.received_offset,
            local_size,
            length: session.length,
            metadata: session.metadata,
            extensions: session.extensions,
            completed: session.completed,
        })
    }

    /// Fix the total length of an upload created with a deferred length.
    pub async fn declare_length(&self, id: &str, length: u64) -> Result<UploadSession, Error> {
        self.session(id).await?;
        let _guard = self.lock(id)?;
        let mut session = self.session(id).await?;

        ensure!(
            session.length == UploadLength::Deferred,
            InvalidLengthSnafu {
                detail: "the upload length is already known",
            }
        );
        ensure!(
            length >= session.received_offset,
            InvalidLengthSnafu {
                detail: format!(
                    "length {length} is below the {} bytes already received",
                    session.received_offset
                ),
            }
        );

        session.length = UploadLength::Known(length);
        self.store.set(&session).await.context(StoreSnafu { id })?;
        debug!("Upload {} declared {} bytes", id, length);
        Ok(session)
    }

    /// Drop an upload: its staging file and its record.
    pub async fn terminate(&self, id: &str) -> Result<(), Error> {
        self.session(id).await?;
        let guard = self.lock(id)?;

        self.staging
            .remove(id)
            .await
            .context(StorageWriteSnafu { id })?;
        self.store.remove(id).await.context(StoreSnafu { id })?;

        drop(guard);
        info!("Terminated upload {}", id);
        Ok(())
    }

    async fn stored(&self, id: &str) -> Result<Option<UploadSession>, Error> {
        self.store.get(id).await.context(StoreSnafu { id })
    }

    async fn session(&self, id: &str) -> Result<UploadSession, Error> {
        match self.stored(id).await? {
            Some(session) => Ok(session),
            None => NotFoundSnafu { id }.fail(),
        }
    }

    /// Exclusive access to one session, failing fast when it is taken.
    fn lock(&self, id: &str) -> Result<SessionGuard, Error> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = locks.entry(id.to_string()).or_default().clone();
        match entry.try_lock_owned() {
            Ok(guard) => Ok(SessionGuard {
                id: id.to_string(),
                guard: Some(guard),
                locks: self.locks.clone(),
            }),
            Err(_) => {
                if locks.get(id).is_some_and(|e| Arc::strong_count(e) == 1) {
                    locks.remove(id);
                }
                ConflictSnafu { id }.fail()
            }
        }
    }

    async fn rollback(&self, id: &str, offset: u64) {
        if let Err(e) = self.staging.truncate(id, offset).await {
            warn!("Failed to roll back staging file of {} to {}: {}", id, offset, e);
        }
    }

    async fn discard_staging(&self, id: &str) {
        if let Err(e) = self.staging.remove(id).await {
            warn!("Failed to remove staging file of {}: {}", id, e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    FileGone,
    InvalidLength,
    OffsetMismatch,
    StorageWrite,
    RemoteWrite,
    ContentPolicyViolation,
    Conflict,
    IdentifierGenerationFailed,
    Completed,
    Store,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Upload {} not found", id))]
    NotFound { id: String },

    #[snafu(display("Upload {} has a session record but no staging file", id))]
    FileGone { id: String },

    #[snafu(display("Invalid upload length: {}", detail))]
    InvalidLength { detail: String },

    #[snafu(display("Upload {} is at offset {}, not {}", id, expected, claimed))]
    OffsetMismatch {
        id: String,
        claimed: u64,
        expected: u64,
    },

    #[snafu(display("Failed to write staging data for upload {}: {}", id, source))]
    StorageWrite { id: String, source: staging::Error },

    #[snafu(display("Remote storage failed {} for upload {}: {}", stage, id, source))]
    RemoteWrite {
        id: String,
        stage: &'static str,
        source: BoxError,
    },

    #[snafu(display(
        "Upload {} is {} minutes long, the limit is {} minutes",
        id,
        minutes,
        limit
    ))]
    ContentPolicyViolation { id: String, minutes: u64, limit: u64 },

    #[snafu(display("Upload {} is already being written", id))]
    Conflict { id: String },

    #[snafu(display("Could not generate a unique upload id in {} attempts", attempts))]
    IdentifierGenerationFailed { attempts: usize },

    #[snafu(display("Upload {} is already complete", id))]
    Completed { id: String },

    #[snafu(display("Session store failed for upload {}: {}", id, source))]
    Store { id: String, source: session::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::FileGone { .. } => ErrorKind::FileGone,
            Error::InvalidLength { .. } => ErrorKind::InvalidLength,
            Error::OffsetMismatch { .. } => ErrorKind::OffsetMismatch,
            Error::StorageWrite { .. } => ErrorKind::StorageWrite,
            Error::RemoteWrite { .. } => ErrorKind::RemoteWrite,
            Error::ContentPolicyViolation { .. } => ErrorKind::ContentPolicyViolation,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::IdentifierGenerationFailed { .. } => ErrorKind::IdentifierGenerationFailed,
            Error::Completed { .. } => ErrorKind::Completed,
            Error::Store { .. } => ErrorKind::Store,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt as _;

    use super::*;
    use crate::{backend::Local, session::MemoryStore, Chunk, Initiated, PartAck};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Initiate {
            dest: String,
            length: Option<u64>,
            content_type: Option<String>,
        },
        Part {
            part_id: u64,
            stage: Stage,
            token: Option<String>,
            data: Vec<u8>,
        },
        Complete {
            token: Option<String>,
        },
    }

    /// Records every call; next part ids count up until a part is sent with
    /// the complete stage.
    #[derive(Default)]
    struct FakeRemote {
        calls: Mutex<Vec<Call>>,
        fail_initiates: AtomicUsize,
        fail_parts: AtomicUsize,
        fail_completes: AtomicUsize,
        /// Ask for another part even after a complete-stage part.
        more_parts: AtomicBool,
    }

    impl FakeRemote {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn parts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Part { .. }))
                .count()
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    fn rejected() -> BoxError {
        "remote said no".into()
    }

    #[async_trait]
    impl MultipartUploader for FakeRemote {
        async fn initiate(
            &self,
            dest: &str,
            length: Option<u64>,
            content_type: Option<&str>,
        ) -> Result<Initiated, BoxError> {
            self.calls.lock().unwrap().push(Call::Initiate {
                dest: dest.to_string(),
                length,
                content_type: content_type.map(str::to_string),
            });
            if Self::take_failure(&self.fail_initiates) {
                return Err(rejected());
            }
            Ok(Initiated {
                token: Some("token-1".to_string()),
                next_part_size: Some(1024),
            })
        }

        async fn upload_part(
            &self,
            _dest: &str,
            part: PartRequest<'_>,
            mut chunk: Chunk,
        ) -> Result<PartAck, BoxError> {
            let mut data = Vec::new();
            chunk.reader.read_to_end(&mut data).await?;
            self.calls.lock().unwrap().push(Call::Part {
                part_id: part.part_id,
                stage: part.stage,
                token: part.token.map(str::to_string),
                data,
            });
            if Self::take_failure(&self.fail_parts) {
                return Err(rejected());
            }
            let more = part.stage == Stage::Upload || self.more_parts.load(Ordering::SeqCst);
            Ok(PartAck {
                next_part_id: more.then_some(part.part_id + 1),
                next_part_size: None,
            })
        }

        async fn complete(&self, _dest: &str, token: Option<&str>) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push(Call::Complete {
                token: token.map(str::to_string),
            });
            if Self::take_failure(&self.fail_completes) {
                return Err(rejected());
            }
            Ok(())
        }
    }

    /// Store that claims every id is already taken.
    struct TakenStore;

    #[async_trait]
    impl SessionStore for TakenStore {
        async fn get(&self, _id: &str) -> Result<Option<UploadSession>, session::Error> {
            Ok(None)
        }

        async fn insert(&self, _session: &UploadSession) -> Result<bool, session::Error> {
            Ok(false)
        }

        async fn set(&self, _session: &UploadSession) -> Result<(), session::Error> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<(), session::Error> {
            Ok(())
        }
    }

    struct FixedProbe(Option<Duration>);

    #[async_trait]
    impl DurationProbe for FixedProbe {
        async fn duration(&self, _path: &Path) -> Option<Duration> {
            self.0
        }
    }

    struct Fixture {
        _dir: temp_dir::TempDir,
        staging: PathBuf,
        remote: Arc<FakeRemote>,
        coordinator: Coordinator,
    }

    async fn fixture_with_probe(probe: Option<Duration>) -> Fixture {
        let dir = temp_dir::TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        let remote = Arc::new(FakeRemote::default());
        let coordinator = Coordinator::new(
            CoordinatorConfig::new(&staging),
            Arc::new(MemoryStore::new()),
            remote.clone(),
            Arc::new(FixedProbe(probe)),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            staging,
            remote,
            coordinator,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_probe(None).await
    }

    fn request(length: Option<u64>) -> CreateRequest {
        let mut extensions = BTreeMap::new();
        extensions.insert("remote_dir".to_string(), "/videos/clip.mp4".to_string());
        CreateRequest {
            length,
            defer_length: false,
            // filename "clip.MP4"
            metadata: "filename Y2xpcC5NUDQ=".to_string(),
            extensions,
        }
    }

    #[tokio::test]
    async fn create_reports_zero_offset() {
        let f = fixture().await;
        let mut events = f.coordinator.subscribe();

        let session = f.coordinator.create(request(Some(10))).await.unwrap();
        assert_eq!(session.remote_token.as_deref(), Some("token-1"));
        assert_eq!(session.required_part_size, Some(1024));

        let status = f.coordinator.get_offset(&session.id).await.unwrap();
        assert_eq!(status.received_offset, 0);
        assert_eq!(status.local_size, 0);
        assert_eq!(status.length, UploadLength::Known(10));
        assert_eq!(status.extensions["remote_dir"], "/videos/clip.mp4");

        assert_eq!(
            f.remote.calls(),
            vec![Call::Initiate {
                dest: "/videos/clip.mp4".to_string(),
                length: Some(10),
                content_type: Some("video/mp4".to_string()),
            }]
        );
        assert_eq!(events.recv().await.unwrap(), UploadEvent::Created(session));
    }

    #[tokio::test]
    async fn initiate_failure_leaves_recoverable_record() {
        let f = fixture().await;
        f.remote.fail_initiates.store(1, Ordering::SeqCst);

        let err = f.coordinator.create(request(Some(10))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteWrite);
        let Error::RemoteWrite { id, .. } = err else {
            unreachable!()
        };

        let status = f.coordinator.get_offset(&id).await.unwrap();
        assert_eq!(status.received_offset, 0);
        assert_eq!(status.length, UploadLength::Known(10));
        assert_eq!(f.coordinator.stored(&id).await.unwrap().unwrap().remote_token, None);
    }

    #[tokio::test]
    async fn exhausted_ids_fail_without_leftovers() {
        let dir = temp_dir::TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        let remote = Arc::new(FakeRemote::default());
        let coordinator = Coordinator::new(
            CoordinatorConfig::new(&staging),
            Arc::new(TakenStore),
            remote.clone(),
            Arc::new(FixedProbe(None)),
        )
        .await
        .unwrap();

        let err = coordinator.create(request(Some(10))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdentifierGenerationFailed);
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn create_without_length_has_no_side_effects() {
        let f = fixture().await;

        let err = f.coordinator.create(request(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);
        assert!(f.remote.calls().is_empty());
        assert_eq!(std::fs::read_dir(&f.staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn chained_writes_complete_the_upload() {
        let f = fixture().await;
        let mut events = f.coordinator.subscribe();
        let session = f.coordinator.create(request(Some(10))).await.unwrap();
        let id = session.id.as_str();

        let offset = f.coordinator.write(id, 0, &mut &b"hello"[..]).await.unwrap();
        assert_eq!(offset, 5);
        assert!(!f.coordinator.get_offset(id).await.unwrap().completed);

        let offset = f.coordinator.write(id, 5, &mut &b"world"[..]).await.unwrap();
        assert_eq!(offset, 10);

        let status = f.coordinator.get_offset(id).await.unwrap();
        assert_eq!(status.received_offset, 10);
        assert_eq!(status.local_size, 10);
        assert!(status.completed);

        let token = Some("token-1".to_string());
        assert_eq!(
            f.remote.calls()[1..],
            [
                Call::Part {
                    part_id: 0,
                    stage: Stage::Upload,
                    token: token.clone(),
                    data: b"hello".to_vec(),
                },
                Call::Part {
                    part_id: 1,
                    stage: Stage::Complete,
                    token: token.clone(),
                    data: b"world".to_vec(),
                },
                Call::Complete { token },
            ]
        );

        assert!(matches!(events.recv().await.unwrap(), UploadEvent::Created(_)));
        match events.recv().await.unwrap() {
            UploadEvent::Completed(done) => assert_eq!(done.received_offset, 10),
            other => panic!("unexpected event {other:?}"),
        }

        let err = f.coordinator.write(id, 10, &mut &b"!"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Completed);
    }

    #[tokio::test]
    async fn failed_relay_keeps_offset_until_retry() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();
        let id = session.id.as_str();

        f.remote.fail_parts.store(1, Ordering::SeqCst);
        let err = f.coordinator.write(id, 0, &mut &b"hello"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteWrite);

        let status = f.coordinator.get_offset(id).await.unwrap();
        assert_eq!(status.received_offset, 0);
        assert_eq!(status.local_size, 0);

        let offset = f.coordinator.write(id, 0, &mut &b"hello"[..]).await.unwrap();
        assert_eq!(offset, 5);
        let status = f.coordinator.get_offset(id).await.unwrap();
        assert_eq!(status.received_offset, 5);
        assert_eq!(f.coordinator.stored(id).await.unwrap().unwrap().next_part_id, 1);
    }

    #[tokio::test]
    async fn failed_completion_keeps_offset() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(5))).await.unwrap();
        let id = session.id.as_str();

        f.remote.fail_completes.store(1, Ordering::SeqCst);
        let err = f.coordinator.write(id, 0, &mut &b"hello"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteWrite);
        let status = f.coordinator.get_offset(id).await.unwrap();
        assert_eq!(status.received_offset, 0);
        assert!(!status.completed);

        assert_eq!(f.coordinator.write(id, 0, &mut &b"hello"[..]).await.unwrap(), 5);
        assert!(f.coordinator.get_offset(id).await.unwrap().completed);
    }

    #[tokio::test]
    async fn long_media_is_rejected_on_first_chunk() {
        let f = fixture_with_probe(Some(Duration::from_secs(20 * 60))).await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();

        let err = f
            .coordinator
            .write(&session.id, 0, &mut &b"hello"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContentPolicyViolation);
        assert_eq!(f.remote.parts(), 0);
        let status = f.coordinator.get_offset(&session.id).await.unwrap();
        assert_eq!(status.received_offset, 0);
        assert_eq!(status.local_size, 0);
    }

    #[tokio::test]
    async fn media_at_the_limit_is_accepted() {
        let f = fixture_with_probe(Some(Duration::from_secs(15 * 60 + 59))).await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();

        let offset = f
            .coordinator
            .write(&session.id, 0, &mut &b"hello"[..])
            .await
            .unwrap();
        assert_eq!(offset, 5);
    }

    #[tokio::test]
    async fn mismatched_offset_is_rejected() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();

        let err = f
            .coordinator
            .write(&session.id, 3, &mut &b"hello"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OffsetMismatch);
        assert_eq!(f.remote.parts(), 0);
    }

    #[tokio::test]
    async fn chunk_past_declared_length_is_rejected() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(4))).await.unwrap();

        let err = f
            .coordinator
            .write(&session.id, 0, &mut &b"hello"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);
        assert_eq!(f.coordinator.get_offset(&session.id).await.unwrap().local_size, 0);
    }

    #[tokio::test]
    async fn concurrent_writes_on_one_session_conflict() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();
        let id = session.id.as_str();

        let (mut r1, mut r2) = (&b"hello"[..], &b"hello"[..]);
        let (first, second) = tokio::join!(
            f.coordinator.write(id, 0, &mut r1),
            f.coordinator.write(id, 0, &mut r2),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            err.kind(),
            ErrorKind::Conflict | ErrorKind::OffsetMismatch
        ));

        assert_eq!(f.remote.parts(), 1);
        let stored = f.coordinator.stored(id).await.unwrap().unwrap();
        assert_eq!(stored.received_offset, 5);
        assert_eq!(stored.next_part_id, 1);
    }

    #[tokio::test]
    async fn lock_entries_go_away_with_their_writers() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();
        let id = session.id.as_str();

        f.coordinator.write(id, 0, &mut &b"hello"[..]).await.unwrap();
        assert!(f.coordinator.locks.lock().unwrap().is_empty());

        let err = f.coordinator.write(id, 3, &mut &b"x"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OffsetMismatch);
        assert!(f.coordinator.locks.lock().unwrap().is_empty());

        let held = f.coordinator.lock(id).unwrap();
        let err = f.coordinator.write(id, 5, &mut &b"world"[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(f.coordinator.locks.lock().unwrap().len(), 1);
        drop(held);
        assert!(f.coordinator.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_completion_while_remote_wants_more() {
        let f = fixture().await;
        let mut events = f.coordinator.subscribe();
        let session = f.coordinator.create(request(Some(5))).await.unwrap();
        f.remote.more_parts.store(true, Ordering::SeqCst);

        let offset = f
            .coordinator
            .write(&session.id, 0, &mut &b"hello"[..])
            .await
            .unwrap();
        assert_eq!(offset, 5);
        assert!(!f.coordinator.get_offset(&session.id).await.unwrap().completed);
        assert!(!f.remote.calls().contains(&Call::Complete {
            token: Some("token-1".to_string())
        }));

        assert!(matches!(events.recv().await.unwrap(), UploadEvent::Created(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn independent_sessions_write_in_parallel() {
        let f = fixture().await;
        let a = f.coordinator.create(request(Some(5))).await.unwrap();
        let b = f.coordinator.create(request(Some(5))).await.unwrap();

        let (mut r1, mut r2) = (&b"aaaaa"[..], &b"bbbbb"[..]);
        let (ra, rb) = tokio::join!(
            f.coordinator.write(&a.id, 0, &mut r1),
            f.coordinator.write(&b.id, 0, &mut r2),
        );
        assert_eq!(ra.unwrap(), 5);
        assert_eq!(rb.unwrap(), 5);
    }

    #[tokio::test]
    async fn offset_lookup_errors() {
        let f = fixture().await;

        let err = f.coordinator.get_offset("unknown").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let session = f.coordinator.create(request(Some(10))).await.unwrap();
        std::fs::remove_file(f.staging.join(&session.id)).unwrap();
        let err = f.coordinator.get_offset(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileGone);

        std::fs::create_dir(f.staging.join(&session.id)).unwrap();
        let err = f.coordinator.get_offset(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = f
            .coordinator
            .write("unknown", 0, &mut &b"x"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn deferred_length_is_declared_later() {
        let f = fixture().await;
        let mut req = request(None);
        req.defer_length = true;
        let session = f.coordinator.create(req).await.unwrap();
        assert_eq!(session.length, UploadLength::Deferred);
        assert!(matches!(
            f.remote.calls()[0],
            Call::Initiate { length: None, .. }
        ));

        assert_eq!(f.coordinator.write(&session.id, 0, &mut &b"hello"[..]).await.unwrap(), 5);

        let err = f.coordinator.declare_length(&session.id, 3).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);
        let declared = f.coordinator.declare_length(&session.id, 10).await.unwrap();
        assert_eq!(declared.length, UploadLength::Known(10));
        let err = f.coordinator.declare_length(&session.id, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLength);

        assert_eq!(f.coordinator.write(&session.id, 5, &mut &b"world"[..]).await.unwrap(), 10);
        assert!(f.coordinator.get_offset(&session.id).await.unwrap().completed);
    }

    #[tokio::test]
    async fn terminate_removes_everything() {
        let f = fixture().await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();

        f.coordinator.terminate(&session.id).await.unwrap();
        assert!(!f.staging.join(&session.id).exists());
        let err = f.coordinator.get_offset(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn aborted_stream_leaves_offset_untouched() {
        struct Broken;

        impl AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "client went away",
                )))
            }
        }

        let f = fixture().await;
        let session = f.coordinator.create(request(Some(10))).await.unwrap();

        let err = f
            .coordinator
            .write(&session.id, 0, &mut Broken)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageWrite);
        assert_eq!(f.remote.parts(), 0);
        assert_eq!(
            f.coordinator.get_offset(&session.id).await.unwrap().received_offset,
            0
        );
    }

    #[tokio::test]
    async fn sessions_survive_restart_with_local_backend() {
        let dir = temp_dir::TempDir::new().unwrap();
        let config = CoordinatorConfig::new(dir.path().join("staging"));
        let store_path = dir.path().join("sessions.json");
        let remote = Arc::new(Local::new(dir.path().join("remote")));

        let coordinator = Coordinator::new(
            config.clone(),
            Arc::new(crate::JsonFileStore::open(&store_path).await.unwrap()),
            remote.clone(),
            Arc::new(crate::probe::NoProbe),
        )
        .await
        .unwrap();
        let session = coordinator.create(request(Some(10))).await.unwrap();
        coordinator
            .write(&session.id, 0, &mut &b"hello"[..])
            .await
            .unwrap();
        drop(coordinator);

        let coordinator = Coordinator::new(
            config,
            Arc::new(crate::JsonFileStore::open(&store_path).await.unwrap()),
            remote,
            Arc::new(crate::probe::NoProbe),
        )
        .await
        .unwrap();
        assert_eq!(
            coordinator.get_offset(&session.id).await.unwrap().received_offset,
            5
        );
        coordinator
            .write(&session.id, 5, &mut &b"world"[..])
            .await
            .unwrap();

        let content = std::fs::read(dir.path().join("remote/videos/clip.mp4")).unwrap();
        assert_eq!(content, b"helloworld");
    }
}
