//! UDP DNS server feeding the reassembly engine
//!
//! Every datagram is handled on its own task. Nothing that happens while
//! handling one query can stop the receive loop; protocol failures turn into
//! a response code and a log line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::config::DripConfig;
use crate::dns::{self, DnsQuery, Rcode, MAX_DNS_UDP_SIZE};
use crate::label;
use crate::reassembly::{Outcome, OutputSink, ReassemblyEngine, ReassemblyError};
use crate::session::SessionStore;

/// Shortest interval between idle sweeps
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed one-minute window on inbound queries
pub struct QueryBudget {
    limit: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl QueryBudget {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Take one query from the current window; false once it is spent
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.0.elapsed() >= self.window {
            *state = (Instant::now(), 0);
        }
        if state.1 >= self.limit {
            return false;
        }
        state.1 += 1;
        true
    }
}

/// Receives tunnelled queries and writes completed transfers
pub struct ExfilServer {
    socket: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
    budget: Option<Arc<QueryBudget>>,
    chunk_timeout: Duration,
}

impl ExfilServer {
    /// Bind `address:port` from `config`
    pub async fn bind(config: &DripConfig, sink: Arc<dyn OutputSink>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(config.listen_addr()).await?;
        let store = Arc::new(SessionStore::new(config.max_sessions, config.max_total_chunks));
        let engine = ReassemblyEngine::new(config, store, sink);
        log::info!(
            "Verifying chunks with {} ({}-character digests)",
            config.checksum_algorithm.as_str(),
            config.checksum_length
        );

        Ok(Self {
            socket: Arc::new(socket),
            handler: Arc::new(QueryHandler::new(engine, config.domain.clone())),
            budget: config
                .server_rate_limit
                .map(|limit| Arc::new(QueryBudget::per_minute(limit))),
            chunk_timeout: config.chunk_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn engine(&self) -> &ReassemblyEngine {
        &self.handler.engine
    }

    /// Serve until the task is dropped
    pub async fn run(self) -> std::io::Result<()> {
        log::info!(
            "Listening on {} (domain: {})",
            self.socket.local_addr()?,
            self.handler.domain.as_deref().unwrap_or("any")
        );

        let sweeper = tokio::spawn(sweep_idle(
            Arc::clone(self.handler.engine.store()),
            self.chunk_timeout,
        ));
        let _sweeper = AbortOnDrop(sweeper);

        let mut buf = vec![0u8; MAX_DNS_UDP_SIZE * 2];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::error!("UDP recv_from error: {}", e);
                    continue;
                }
            };

            if let Some(budget) = &self.budget {
                if !budget.try_acquire().await {
                    log::debug!("Query budget spent, dropping query from {}", peer);
                    continue;
                }
            }

            let packet = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Some(response) = handler.handle_packet(&packet).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        log::warn!("Failed to answer {}: {}", peer, e);
                    }
                }
            });
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn sweep_idle(store: Arc<SessionStore>, chunk_timeout: Duration) {
    let mut interval = tokio::time::interval((chunk_timeout / 4).max(MIN_SWEEP_INTERVAL));
    loop {
        interval.tick().await;
        for id in store.evict_idle(chunk_timeout, chunk_timeout).await {
            log::warn!(
                "Session {} abandoned after {:?} without activity",
                id,
                chunk_timeout
            );
        }
    }
}

/// Turns one query datagram into a response
pub struct QueryHandler {
    engine: ReassemblyEngine,
    domain: Option<String>,
}

impl QueryHandler {
    pub fn new(engine: ReassemblyEngine, domain: Option<String>) -> Self {
        Self { engine, domain }
    }

    pub fn engine(&self) -> &ReassemblyEngine {
        &self.engine
    }

    /// Response bytes for `packet`; `None` when it is not a usable query
    pub async fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = match dns::parse_query(packet) {
            Ok(query) => query,
            Err(e) => {
                log::debug!("Dropping malformed packet: {}", e);
                return None;
            }
        };

        let rcode = self.answer(&query).await;
        Some(dns::build_response(&query, packet, rcode))
    }

    /// Response code for a parsed query
    pub async fn answer(&self, query: &DnsQuery) -> Rcode {
        let label = match label::strip_domain(&query.qname, self.domain.as_deref()) {
            Ok(label) => label,
            Err(e) => {
                log::debug!("{}", e);
                return Rcode::NxDomain;
            }
        };

        match self.engine.handle_label(label).await {
            Ok(outcome) => {
                log_outcome(&outcome);
                Rcode::NoError
            }
            Err(e) => reply_for_error(&e),
        }
    }
}

fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Accepted {
            session_id,
            sequence,
        } => log::debug!("Session {} accepted chunk {}", session_id, sequence),
        Outcome::Duplicate {
            session_id,
            sequence,
        } => log::debug!("Session {} duplicate chunk {}", session_id, sequence),
        Outcome::AlreadyComplete { session_id } => {
            log::debug!("Session {} already complete", session_id)
        }
        Outcome::Written { .. } => {}
    }
}

fn reply_for_error(err: &ReassemblyError) -> Rcode {
    match err {
        ReassemblyError::Parse(e) => {
            log::warn!("Discarding label: {}", e);
            Rcode::NxDomain
        }
        // Retrying may get an intact copy through
        ReassemblyError::ChecksumMismatch { .. } => {
            log::warn!("{}", err);
            Rcode::ServFail
        }
        ReassemblyError::Output { .. } => {
            log::error!("{}", err);
            Rcode::ServFail
        }
        ReassemblyError::IncompleteAtCompletion { .. }
        | ReassemblyError::IncompleteEncoding { .. } => {
            log::warn!("{}; waiting for the missing chunks", err);
            Rcode::NoError
        }
        // The transfer is lost; the sender must not count this as delivered
        ReassemblyError::Abandoned { .. } => Rcode::Refused,
        ReassemblyError::SessionAbandoned { .. } => {
            log::warn!("{}", err);
            Rcode::Refused
        }
        ReassemblyError::ConflictingChunk { .. }
        | ReassemblyError::SessionSizeExceeded { .. }
        | ReassemblyError::ReassemblyDecode { .. }
        | ReassemblyError::Store(_)
        | ReassemblyError::ChunkLimit => {
            log::warn!("{}", err);
            Rcode::NoError
        }
    }
}
