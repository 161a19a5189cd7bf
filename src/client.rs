//! Client transfer engine
//!
//! A transfer is prepared up front (encode, chunk, format every query name)
//! so every size and label problem surfaces before the first packet. It is
//! then sent strictly in sequence order, one chunk in flight at a time, with
//! pacing and retries driven by [`RateController`] and [`RetryState`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec;
use crate::config::DripConfig;
use crate::dns::{DnsError, QuerySender};
use crate::label::{query_name, LabelCodec, LabelError, MAX_QNAME_LEN, MAX_SEQUENCE};
use crate::rate::{RateController, RetryDecision, RetryState};

/// Client-side transfer errors; each is fatal to its own job only
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("input is {size} bytes, maximum is {max}")]
    InputTooLarge { size: u64, max: usize },

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error("query name is {len} characters, maximum is 253; use a shorter domain")]
    QueryNameTooLong { len: usize },

    #[error("input needs {chunks} chunks, the sequence field holds {max}")]
    TooManyChunks { chunks: usize, max: usize },

    #[error("chunk {sequence} not delivered after {attempts} attempts: {source}")]
    ChunkDeliveryFailed {
        sequence: u16,
        attempts: u32,
        source: DnsError,
    },

    #[error("completion marker not delivered after {attempts} attempts: {source}")]
    CompletionFailed { attempts: u32, source: DnsError },

    #[error("transfer cancelled after {sent} chunks")]
    Cancelled { sent: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aborts a running transfer before its next send attempt
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A fully prepared transfer
#[derive(Debug, Clone)]
pub struct TransferJob {
    session_id: String,
    queries: Vec<String>,
    done_query: String,
    bytes: usize,
    encoded_len: usize,
}

impl TransferJob {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Query names for each chunk, in sequence order
    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    /// Query name carrying the completion marker
    pub fn done_query(&self) -> &str {
        &self.done_query
    }

    pub fn chunk_count(&self) -> usize {
        self.queries.len()
    }

    /// Raw input size
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }
}

/// Summary of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub session_id: String,
    pub chunks: usize,
    pub bytes: usize,
    /// Retries across all chunks and the completion marker
    pub retries: u32,
    pub elapsed: Duration,
}

enum DeliveryError {
    Cancelled,
    Exhausted { attempts: u32, source: DnsError },
}

/// Sends files as sequences of DNS queries
pub struct TransferEngine {
    config: DripConfig,
    codec: LabelCodec,
    sender: Arc<dyn QuerySender>,
    domain: String,
    cancel: CancelHandle,
}

impl TransferEngine {
    pub fn new(config: DripConfig, sender: Arc<dyn QuerySender>, domain: impl Into<String>) -> Self {
        Self {
            codec: config.label_codec(),
            config,
            sender,
            domain: domain.into(),
            cancel: CancelHandle::new(),
        }
    }

    /// Handle that cancels transfers run by this engine
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Encode and chunk `data` under a fresh session id
    pub fn prepare(&self, data: &[u8]) -> Result<TransferJob, TransferError> {
        let session_id = codec::generate_session_id(self.config.session_id_length);
        self.prepare_session(&session_id, data)
    }

    /// Like [`prepare`](Self::prepare) with a caller-chosen session id
    pub fn prepare_session(&self, session_id: &str, data: &[u8]) -> Result<TransferJob, TransferError> {
        if data.len() > self.config.max_total_size {
            return Err(TransferError::InputTooLarge {
                size: data.len() as u64,
                max: self.config.max_total_size,
            });
        }

        let encoded = codec::encode(data);
        let chunk_size = self.config.chunk_size.max(1);
        let chunks = (encoded.len() + chunk_size - 1) / chunk_size;
        let max = MAX_SEQUENCE as usize + 1;
        if chunks > max {
            return Err(TransferError::TooManyChunks { chunks, max });
        }

        // Base32 output is ASCII, so byte chunks are valid str slices
        let mut queries = Vec::with_capacity(chunks);
        let mut start = 0;
        while start < encoded.len() {
            let end = (start + chunk_size).min(encoded.len());
            let label = self
                .codec
                .format(session_id, queries.len(), &encoded[start..end])?;
            queries.push(self.full_name(&label)?);
            start = end;
        }

        let done_query = self.full_name(&self.codec.format_done(session_id)?)?;

        log::debug!(
            "Prepared session {}: {} bytes, {} encoded chars, {} chunks",
            session_id,
            data.len(),
            encoded.len(),
            queries.len()
        );

        Ok(TransferJob {
            session_id: session_id.to_ascii_uppercase(),
            queries,
            done_query,
            bytes: data.len(),
            encoded_len: encoded.len(),
        })
    }

    fn full_name(&self, label: &str) -> Result<String, TransferError> {
        let name = query_name(label, &self.domain);
        if name.len() > MAX_QNAME_LEN {
            return Err(TransferError::QueryNameTooLong { len: name.len() });
        }
        Ok(name)
    }

    /// Read and send a file
    pub async fn send_file(&self, path: &Path) -> Result<TransferReport, TransferError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.config.max_total_size as u64 {
            return Err(TransferError::InputTooLarge {
                size,
                max: self.config.max_total_size,
            });
        }

        let data = tokio::fs::read(path).await?;
        let job = self.prepare(&data)?;
        log::info!(
            "Sending {} ({} bytes) as session {} in {} chunks",
            path.display(),
            data.len(),
            job.session_id(),
            job.chunk_count()
        );
        self.run(&job).await
    }

    /// Send every chunk in order, then the completion marker
    pub async fn run(&self, job: &TransferJob) -> Result<TransferReport, TransferError> {
        let mut rate = RateController::from_config(&self.config);
        let started = Instant::now();
        let total = job.chunk_count();
        let mut retries = 0u32;
        let mut next_progress = 10;

        for (sequence, qname) in job.queries.iter().enumerate() {
            if sequence > 0 {
                pause(&rate).await;
            }

            retries += self.deliver(&mut rate, qname).await.map_err(|e| match e {
                DeliveryError::Cancelled => TransferError::Cancelled { sent: sequence },
                DeliveryError::Exhausted { attempts, source } => TransferError::ChunkDeliveryFailed {
                    sequence: sequence as u16,
                    attempts,
                    source,
                },
            })?;

            log::debug!(
                "Session {} chunk {}/{} delivered (delay {:?})",
                job.session_id,
                sequence + 1,
                total,
                rate.current_delay()
            );
            let percent = (sequence + 1) * 100 / total;
            if percent >= next_progress {
                log::info!(
                    "Session {}: {}% ({}/{} chunks)",
                    job.session_id,
                    percent,
                    sequence + 1,
                    total
                );
                next_progress = (percent / 10 + 1) * 10;
            }
        }

        if total > 0 {
            pause(&rate).await;
        }
        retries += self
            .deliver(&mut rate, &job.done_query)
            .await
            .map_err(|e| match e {
                DeliveryError::Cancelled => TransferError::Cancelled { sent: total },
                DeliveryError::Exhausted { attempts, source } => {
                    TransferError::CompletionFailed { attempts, source }
                }
            })?;

        let report = TransferReport {
            session_id: job.session_id.clone(),
            chunks: total,
            bytes: job.bytes,
            retries,
            elapsed: started.elapsed(),
        };
        log::info!(
            "Session {} sent: {} bytes in {} chunks, {} retries, {:.1}s",
            report.session_id,
            report.bytes,
            report.chunks,
            report.retries,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    /// Send one query until it is delivered or retries run out
    async fn deliver(&self, rate: &mut RateController, qname: &str) -> Result<u32, DeliveryError> {
        let mut retry = RetryState::new(self.config.max_retries);

        loop {
            if self.cancel.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            match self.sender.send_query(qname).await {
                Ok(latency) => {
                    rate.record_success(latency);
                    return Ok(retry.retries());
                }
                Err(source) => match retry.on_failure(rate) {
                    RetryDecision::Retry { retry: n } => {
                        log::warn!(
                            "Query {} failed ({}), retry {}/{} in {:?}",
                            qname,
                            source,
                            n,
                            self.config.max_retries,
                            rate.current_delay()
                        );
                        pause(rate).await;
                    }
                    RetryDecision::GiveUp { attempts } => {
                        log::error!("Query {} failed after {} attempts: {}", qname, attempts, source);
                        return Err(DeliveryError::Exhausted { attempts, source });
                    }
                },
            }
        }
    }
}

async fn pause(rate: &RateController) {
    let delay = rate.next_delay(&mut rand::thread_rng());
    tokio::time::sleep(delay).await;
}
