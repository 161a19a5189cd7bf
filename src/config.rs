//! dnsdrip configuration
//!
//! One immutable [`DripConfig`] is loaded (TOML) or defaulted at startup,
//! validated once, and handed to the client and server components.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checksum::ChecksumAlgorithm;
use crate::codec;
use crate::label::{LabelCodec, MAX_LABEL_LEN, MAX_SEQUENCE};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_size must be between 40 and 50 characters, got {0}")]
    ChunkSize(usize),

    #[error("label would be {len} characters (max {max}); reduce chunk_size")]
    LabelTooLong { len: usize, max: usize },

    #[error("session_id_length must be between 4 and 8 characters, got {0}")]
    SessionIdLength(usize),

    #[error("checksum_length must be between 2 and 4 characters, got {0}")]
    ChecksumLength(usize),

    #[error("{0}")]
    Invalid(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main dnsdrip configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DripConfig {
    /// Base32 characters of payload per chunk (40-50)
    pub chunk_size: usize,

    /// Session id length in base32 characters
    pub session_id_length: usize,

    /// Checksum length in base32 characters
    pub checksum_length: usize,

    /// Maximum transfer size in raw bytes
    pub max_total_size: usize,

    /// Base pace in queries per minute
    pub base_rate_limit: u32,

    /// Fastest pace in queries per minute
    pub max_rate_limit: u32,

    /// Adjust pacing from observed latency
    pub enable_adaptive_rate: bool,

    /// Randomise each delay by +/- `jitter`
    pub enable_jitter: bool,

    /// Jitter fraction (0.2 = +/-20%)
    pub jitter: f64,

    /// Retries per chunk before the transfer is aborted
    pub max_retries: u32,

    /// Time to wait for each DNS response
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Digest algorithm; client and server must agree
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Directory for reassembled files
    pub output_dir: PathBuf,

    /// Directory for log files (stderr when unset)
    pub log_dir: Option<PathBuf>,

    /// Server UDP port
    pub port: u16,

    /// Server bind address
    pub address: IpAddr,

    /// Zone suffix the server strips from query names
    pub domain: Option<String>,

    /// Idle time after which an open session is abandoned
    #[serde(with = "humantime_serde")]
    pub chunk_timeout: Duration,

    /// Concurrent sessions tracked by the server
    pub max_sessions: usize,

    /// Stored chunks across all sessions
    pub max_total_chunks: usize,

    /// Global server budget in queries per minute
    pub server_rate_limit: Option<u32>,

    /// Failed decode attempts before a session is abandoned
    pub max_decode_attempts: u32,

    /// Reserved; no authentication protocol is defined
    pub require_auth: bool,

    /// Reserved
    pub auth_key: Option<String>,
}

impl Default for DripConfig {
    fn default() -> Self {
        Self {
            chunk_size: 45,
            session_id_length: 6,
            checksum_length: 3,
            max_total_size: 200 * 1024,
            base_rate_limit: 75,
            max_rate_limit: 150,
            enable_adaptive_rate: true,
            enable_jitter: true,
            jitter: 0.2,
            max_retries: 5,
            query_timeout: Duration::from_secs(2),
            checksum_algorithm: ChecksumAlgorithm::Crc16,
            output_dir: PathBuf::from("output"),
            log_dir: None,
            port: 53,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            domain: None,
            chunk_timeout: Duration::from_secs(300),
            max_sessions: 100,
            max_total_chunks: 50_000,
            server_rate_limit: None,
            max_decode_attempts: 3,
            require_auth: false,
            auth_key: None,
        }
    }
}

impl DripConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Label geometry shared by client and server
    pub fn label_codec(&self) -> LabelCodec {
        LabelCodec::new(self.session_id_length, self.checksum_length)
    }

    /// Server listen address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Encoded length limit corresponding to `max_total_size`
    pub fn max_encoded_len(&self) -> usize {
        codec::encoded_len(self.max_total_size)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(40..=50).contains(&self.chunk_size) {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if !(4..=8).contains(&self.session_id_length) {
            return Err(ConfigError::SessionIdLength(self.session_id_length));
        }
        if !(2..=4).contains(&self.checksum_length) {
            return Err(ConfigError::ChecksumLength(self.checksum_length));
        }

        let label_len = self.label_codec().overhead() + self.chunk_size;
        if label_len > MAX_LABEL_LEN {
            return Err(ConfigError::LabelTooLong {
                len: label_len,
                max: MAX_LABEL_LEN,
            });
        }

        if self.max_total_size == 0 {
            return Err(invalid("max_total_size must be positive"));
        }
        let chunks_needed = (self.max_encoded_len() + self.chunk_size - 1) / self.chunk_size;
        if chunks_needed > MAX_SEQUENCE as usize + 1 {
            return Err(ConfigError::Invalid(format!(
                "max_total_size of {} bytes needs {} chunks; at most {} fit the sequence field",
                self.max_total_size,
                chunks_needed,
                MAX_SEQUENCE as usize + 1
            )));
        }

        if self.base_rate_limit == 0 {
            return Err(invalid("base_rate_limit must be positive"));
        }
        if self.max_rate_limit < self.base_rate_limit {
            return Err(invalid("max_rate_limit must be >= base_rate_limit"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(invalid("jitter must be in [0, 1)"));
        }
        if self.query_timeout.is_zero() {
            return Err(invalid("query_timeout must be positive"));
        }
        if self.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        if self.max_sessions == 0 {
            return Err(invalid("max_sessions must be positive"));
        }
        if self.max_total_chunks == 0 {
            return Err(invalid("max_total_chunks must be positive"));
        }
        if self.server_rate_limit == Some(0) {
            return Err(invalid("server_rate_limit must be positive when set"));
        }
        if self.max_decode_attempts == 0 {
            return Err(invalid("max_decode_attempts must be positive"));
        }
        if self.require_auth {
            return Err(invalid("require_auth is reserved and not supported"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DripConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 45);
        assert_eq!(config.listen_addr().port(), 53);
    }

    #[test]
    fn test_chunk_size_bounds() {
        let mut config = DripConfig::default();
        config.chunk_size = 39;
        assert!(matches!(config.validate(), Err(ConfigError::ChunkSize(39))));
        config.chunk_size = 51;
        assert!(matches!(config.validate(), Err(ConfigError::ChunkSize(51))));
    }

    #[test]
    fn test_label_bound_rejected_at_config_time() {
        let mut config = DripConfig::default();
        config.chunk_size = 50;
        // 6 + 1 + 4 + 1 + 50 + 1 + 3 = 66
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LabelTooLong { len: 66, max: 63 })
        ));

        config.chunk_size = 47;
        assert!(config.validate().is_ok());

        config.session_id_length = 8;
        config.checksum_length = 4;
        assert!(matches!(config.validate(), Err(ConfigError::LabelTooLong { .. })));
    }

    #[test]
    fn test_rate_limits() {
        let mut config = DripConfig::default();
        config.max_rate_limit = 10;
        assert!(config.validate().is_err());

        config.max_rate_limit = 150;
        config.base_rate_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_total_size_fits_sequence_space() {
        let mut config = DripConfig::default();
        config.max_total_size = 10 * 1024 * 1024;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_reserved_auth_rejected() {
        let mut config = DripConfig::default();
        config.require_auth = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = DripConfig::default();
        config.domain = Some("x.example.com".to_string());
        config.query_timeout = Duration::from_millis(1500);

        let text = config.to_toml().unwrap();
        assert!(text.contains("query_timeout = \"1s 500ms\""));
        let parsed: DripConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: DripConfig = toml::from_str("chunk_size = 40\nport = 5353\n").unwrap();
        assert_eq!(parsed.chunk_size, 40);
        assert_eq!(parsed.port, 5353);
        assert_eq!(parsed.base_rate_limit, 75);
        assert!(parsed.validate().is_ok());
    }
}
