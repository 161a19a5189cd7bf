//! Server-side reassembly
//!
//! Chunks are verified, stored per session, and once the completion marker
//! has been seen and sequences `0..=highest` are all present the session is
//! decoded and written out. A marker that arrives ahead of missing chunks,
//! or ahead of a trailing chunk the encoded length still lacks, leaves the
//! session open; the late chunk finishes it.
//!
//! The session lock is held across decode and write, so a chunk for the same
//! session arriving mid-write waits rather than being lost.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::codec::{self, DecodeError};
use crate::config::DripConfig;
use crate::label::{Label, LabelCodec, ParseError, ParsedChunk};
use crate::session::{
    Session, SessionHandle, SessionState, SessionStore, StoreError, StoreResult,
};

/// Destination for reassembled transfers
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Persist `data` for `session_id`; returns where it went
    async fn write(
        &self,
        session_id: &str,
        timestamp: DateTime<Local>,
        data: &[u8],
    ) -> std::io::Result<PathBuf>;
}

/// Writes each transfer to `<dir>/<session>_<timestamp>.bin`
#[derive(Debug, Clone)]
pub struct FsSink {
    dir: PathBuf,
}

impl FsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl OutputSink for FsSink {
    async fn write(
        &self,
        session_id: &str,
        timestamp: DateTime<Local>,
        data: &[u8],
    ) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let stem = format!("{}_{}", session_id, timestamp.format("%Y%m%dT%H%M%S%.3f"));
        for attempt in 0..100u32 {
            let name = if attempt == 0 {
                format!("{}.bin", stem)
            } else {
                format!("{}-{}.bin", stem, attempt)
            };
            let path = self.dir.join(name);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(data).await?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free output name for {}", stem),
        ))
    }
}

/// Keeps written transfers in memory, keyed by session id
#[derive(Debug, Default)]
pub struct MemorySink {
    outputs: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All writes so far, in order
    pub async fn outputs(&self) -> Vec<(String, Vec<u8>)> {
        self.outputs.lock().await.clone()
    }

    /// Bytes written for `session_id`, if any
    pub async fn get(&self, session_id: &str) -> Option<Vec<u8>> {
        self.outputs
            .lock()
            .await
            .iter()
            .find(|(id, _)| id == session_id)
            .map(|(_, data)| data.clone())
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write(
        &self,
        session_id: &str,
        _timestamp: DateTime<Local>,
        data: &[u8],
    ) -> std::io::Result<PathBuf> {
        self.outputs
            .lock()
            .await
            .push((session_id.to_string(), data.to_vec()));
        Ok(PathBuf::from(format!("memory:{}", session_id)))
    }
}

/// Non-error results of handling a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New chunk stored; waiting for more
    Accepted { session_id: String, sequence: u16 },
    /// Identical chunk already stored
    Duplicate { session_id: String, sequence: u16 },
    /// Session decoded and written
    Written {
        session_id: String,
        path: PathBuf,
        bytes: usize,
    },
    /// Session already finished; nothing to do
    AlreadyComplete { session_id: String },
}

/// Reasons a label was not (or not yet) turned into output
#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    #[error("unparseable label: {0}")]
    Parse(#[from] ParseError),

    #[error("checksum mismatch for session {session_id} chunk {sequence}")]
    ChecksumMismatch { session_id: String, sequence: u16 },

    #[error("session {session_id} chunk {sequence} conflicts with the stored copy")]
    ConflictingChunk { session_id: String, sequence: u16 },

    #[error("session {session_id} would exceed {limit} encoded characters")]
    SessionSizeExceeded { session_id: String, limit: usize },

    #[error("session {session_id} completed with chunk {missing} missing")]
    IncompleteAtCompletion { session_id: String, missing: u16 },

    #[error("session {session_id} completed with {length} encoded characters; more chunks needed")]
    IncompleteEncoding { session_id: String, length: usize },

    #[error("session {session_id} failed to decode (attempt {attempts}): {source}")]
    ReassemblyDecode {
        session_id: String,
        attempts: u32,
        source: DecodeError,
    },

    #[error("session {session_id} abandoned after {attempts} failed decodes")]
    Abandoned { session_id: String, attempts: u32 },

    #[error("session {session_id} was abandoned; nothing further is stored")]
    SessionAbandoned { session_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("server chunk limit reached")]
    ChunkLimit,

    #[error("failed to write output for session {session_id}: {source}")]
    Output {
        session_id: String,
        source: std::io::Error,
    },
}

/// Accepts labels and turns completed sessions into output
pub struct ReassemblyEngine {
    store: Arc<SessionStore>,
    codec: LabelCodec,
    sink: Arc<dyn OutputSink>,
    max_encoded_len: usize,
    max_decode_attempts: u32,
}

impl ReassemblyEngine {
    pub fn new(config: &DripConfig, store: Arc<SessionStore>, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            store,
            codec: config.label_codec(),
            sink,
            max_encoded_len: config.max_encoded_len(),
            max_decode_attempts: config.max_decode_attempts,
        }
    }

    /// Engine with its own store sized from `config`
    pub fn with_sink(config: &DripConfig, sink: Arc<dyn OutputSink>) -> Self {
        let store = Arc::new(SessionStore::new(config.max_sessions, config.max_total_chunks));
        Self::new(config, store, sink)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn label_codec(&self) -> LabelCodec {
        self.codec
    }

    /// Parse and handle a raw label
    pub async fn handle_label(&self, raw: &str) -> Result<Outcome, ReassemblyError> {
        let label = self.codec.parse(raw)?;
        self.handle(label).await
    }

    pub async fn handle(&self, label: Label) -> Result<Outcome, ReassemblyError> {
        match label {
            Label::Chunk(chunk) => self.accept_chunk(chunk).await,
            Label::Done { session_id } => self.complete(&session_id).await,
        }
    }

    /// Verify and store one chunk
    pub async fn accept_chunk(&self, chunk: ParsedChunk) -> Result<Outcome, ReassemblyError> {
        if !chunk.checksum_ok() {
            return Err(ReassemblyError::ChecksumMismatch {
                session_id: chunk.session_id,
                sequence: chunk.sequence,
            });
        }

        let handle = match self.open_session(&chunk.session_id).await? {
            Ok(handle) => handle,
            Err(outcome) => return Ok(outcome),
        };

        let mut session = handle.lock().await;
        if let Some(finished) = finished_outcome(&session) {
            return finished;
        }
        session.touch();

        if let Some(existing) = session.get(chunk.sequence) {
            if existing.payload != chunk.payload || existing.checksum != chunk.checksum {
                return Err(ReassemblyError::ConflictingChunk {
                    session_id: chunk.session_id,
                    sequence: chunk.sequence,
                });
            }
            return Ok(Outcome::Duplicate {
                session_id: chunk.session_id,
                sequence: chunk.sequence,
            });
        }

        if session.encoded_len() + chunk.payload.len() > self.max_encoded_len {
            return Err(ReassemblyError::SessionSizeExceeded {
                session_id: chunk.session_id,
                limit: self.max_encoded_len,
            });
        }

        if !self.store.try_reserve_chunk() {
            return Err(ReassemblyError::ChunkLimit);
        }

        match session.store(chunk.sequence, &chunk.payload, &chunk.checksum) {
            StoreResult::Inserted => {}
            StoreResult::Duplicate | StoreResult::Conflict => self.store.release_chunks(1),
        }
        log::debug!(
            "Session {} stored chunk {} ({} chars, {} total)",
            chunk.session_id,
            chunk.sequence,
            chunk.payload.len(),
            session.encoded_len()
        );

        if session.complete_marker_seen() {
            // A late chunk may close the last gap
            return match self.try_finish(&mut session).await {
                Err(
                    ReassemblyError::IncompleteAtCompletion { .. }
                    | ReassemblyError::IncompleteEncoding { .. },
                ) => Ok(Outcome::Accepted {
                    session_id: chunk.session_id,
                    sequence: chunk.sequence,
                }),
                other => other,
            };
        }

        Ok(Outcome::Accepted {
            session_id: chunk.session_id,
            sequence: chunk.sequence,
        })
    }

    /// Handle the completion marker for `session_id`
    pub async fn complete(&self, session_id: &str) -> Result<Outcome, ReassemblyError> {
        let handle = match self.open_session(session_id).await? {
            Ok(handle) => handle,
            Err(outcome) => return Ok(outcome),
        };

        let mut session = handle.lock().await;
        if let Some(finished) = finished_outcome(&session) {
            return finished;
        }
        session.touch();
        session.mark_complete();

        self.try_finish(&mut session).await
    }

    /// Handle for an open session, or the outcome for a tombstoned one
    async fn open_session(
        &self,
        session_id: &str,
    ) -> Result<Result<SessionHandle, Outcome>, ReassemblyError> {
        match self.store.get_or_create(session_id).await {
            Ok(handle) => Ok(Ok(handle)),
            Err(StoreError::AlreadyCompleted(session_id)) => {
                Ok(Err(Outcome::AlreadyComplete { session_id }))
            }
            Err(StoreError::Abandoned(session_id)) => {
                Err(ReassemblyError::SessionAbandoned { session_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_finish(&self, session: &mut Session) -> Result<Outcome, ReassemblyError> {
        let session_id = session.id().to_string();

        if let Some(missing) = session.first_gap() {
            return Err(ReassemblyError::IncompleteAtCompletion {
                session_id,
                missing,
            });
        }

        let encoded = session.contiguous_prefix();
        let data = match codec::decode(&encoded) {
            Ok(data) => data,
            // A trailing chunk has not arrived yet; not a decode failure
            Err(source) if source.is_incomplete() => {
                return Err(ReassemblyError::IncompleteEncoding {
                    session_id,
                    length: encoded.len(),
                });
            }
            Err(source) => {
                let attempts = session.record_decode_failure();
                if attempts >= self.max_decode_attempts {
                    session.set_state(SessionState::Abandoned);
                    self.store.abandon(&session_id, session.chunk_count()).await;
                    log::error!(
                        "Abandoning session {} after {} failed decodes: {}",
                        session_id,
                        attempts,
                        source
                    );
                    return Err(ReassemblyError::Abandoned {
                        session_id,
                        attempts,
                    });
                }
                return Err(ReassemblyError::ReassemblyDecode {
                    session_id,
                    attempts,
                    source,
                });
            }
        };

        session.set_state(SessionState::Decoded);
        let bytes = data.len();

        match self.sink.write(&session_id, Local::now(), &data).await {
            Ok(path) => {
                session.set_state(SessionState::Written);
                self.store.complete(&session_id, session.chunk_count()).await;
                log::info!(
                    "Session {} complete: {} bytes from {} chunks in {:.1}s -> {}",
                    session_id,
                    bytes,
                    session.chunk_count(),
                    session.age().as_secs_f64(),
                    path.display()
                );
                Ok(Outcome::Written {
                    session_id,
                    path,
                    bytes,
                })
            }
            Err(source) => {
                // Stay open so a retried completion marker can write again
                session.set_state(SessionState::Open);
                Err(ReassemblyError::Output { session_id, source })
            }
        }
    }
}

/// Result for a session a waiting caller finds already finished
fn finished_outcome(session: &Session) -> Option<Result<Outcome, ReassemblyError>> {
    let session_id = session.id().to_string();
    match session.state() {
        SessionState::Written => Some(Ok(Outcome::AlreadyComplete { session_id })),
        SessionState::Abandoned => Some(Err(ReassemblyError::SessionAbandoned { session_id })),
        SessionState::Open | SessionState::Decoded => None,
    }
}
