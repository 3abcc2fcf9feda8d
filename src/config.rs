use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Standard block size (16 KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Whether connections are obfuscated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Plaintext legacy handshake only
    Disabled,
    /// Offer RC4, accept plaintext
    Preferred,
    /// RC4 only
    Required,
}

/// Configuration of the whole engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub negotiator: NegotiatorConfig,
    pub connection: LoopConfig,
    pub omnibus: OmnibusConfig,
    pub retriever: RetrieverConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    pub encryption: EncryptionMode,
    /// Deadline for the whole handshake, key exchange included
    pub timeout: Duration,
    /// Upper bound of random padding appended to our public key
    pub max_padding: usize,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            encryption: EncryptionMode::Preferred,
            timeout: Duration::from_secs(10),
            max_padding: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Largest accepted declared frame length
    pub max_message_size: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_message_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmnibusConfig {
    pub block_size: u32,
    /// Age after which an unanswered reservation is reclaimed
    pub reservation_timeout: Duration,
    pub sweep_interval: Duration,
    /// Maximum number of blocks reserved to a single peer at once
    pub max_outstanding_per_peer: usize,
}

impl Default for OmnibusConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            reservation_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            max_outstanding_per_peer: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Score decrease per reserved block
    pub reserved_penalty: u32,
    /// Score decrease per expired block
    pub expired_penalty: u32,
    /// Score decrease for every peer that contributed to a piece failing
    /// verification. `None` penalizes nobody.
    pub invalid_piece_penalty: Option<u32>,
    /// Period of the sweep-and-reschedule tick
    pub tick_interval: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            reserved_penalty: 1,
            expired_penalty: 20,
            invalid_piece_penalty: None,
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.omnibus.block_size, 16384);
        assert_eq!(config.retriever.expired_penalty, 20);
        assert_eq!(config.retriever.reserved_penalty, 1);
        assert_eq!(config.negotiator.encryption, EncryptionMode::Preferred);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let json = r#"{ "negotiator": { "encryption": "required" }, "omnibus": { "max_outstanding_per_peer": 4 } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.negotiator.encryption, EncryptionMode::Required);
        assert_eq!(config.negotiator.max_padding, 512);
        assert_eq!(config.omnibus.max_outstanding_per_peer, 4);
        assert_eq!(config.omnibus.reservation_timeout, Duration::from_secs(30));
        assert_eq!(config.connection, LoopConfig::default());
    }
}
