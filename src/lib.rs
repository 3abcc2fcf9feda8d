//! Peer wire engine: handshake negotiation, message framing and dispatch, and
//! the per-file block reservation engine that decides which peer serves
//! which block.

pub mod bitfield;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod negotiator;
pub mod omnibus;
pub mod peer;
pub mod retriever;
pub mod session;
pub mod storage;

pub use bitfield::Bitfield;
pub use common::{ConnectionId, FileHash, PeerId};
pub use config::{EncryptionMode, EngineConfig};
pub use engine::{Engine, FileTask};
pub use error::{LeakError, Result};
pub use negotiator::{HandshakeCompleted, Negotiator};
pub use omnibus::{Omnibus, OmnibusEvent, OmnibusListener, OmnibusService};
pub use peer::{Communicator, PeerEvent, PeerMessage};
pub use retriever::{PeerCollector, Retriever, RetrieverCallback};
pub use storage::{HashVerifier, Repository};
