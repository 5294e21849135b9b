//! Cluster message envelope with transparent payload compression

use super::message::ClusterMsg;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Payloads above this many encoded bytes travel compressed.
pub const COMPRESS_THRESHOLD: usize = 128;

/// Outer bound on any envelope accepted off the bus.
pub const MAX_ENVELOPE_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("declared size {declared} but decompressed to {got}")]
    SizeMismatch { declared: usize, got: usize },
    #[error("envelope too large: {0} bytes")]
    TooLarge(usize),
}

/// Which daemon within a node a message addresses or originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonKind {
    Controller,
    Executor,
    Fencer,
    Store,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: NodeId,
    pub uname: String,
    pub pid: u32,
    pub kind: DaemonKind,
}

/// Destination constraint. A set id that does not match the local node means
/// the message is for somebody else and is dropped unread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: Option<NodeId>,
    pub uname: Option<String>,
    pub kind: DaemonKind,
    pub is_local: bool,
}

impl HostSpec {
    pub fn broadcast(kind: DaemonKind) -> Self {
        Self {
            id: None,
            uname: None,
            kind,
            is_local: false,
        }
    }

    pub fn node(id: NodeId, uname: &str, kind: DaemonKind) -> Self {
        Self {
            id: Some(id),
            uname: Some(uname.to_string()),
            kind,
            is_local: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Sender,
    pub host: HostSpec,
    /// Message class, mirroring the payload's command string.
    pub class: String,
    /// Monotonically increasing per sender.
    pub id: u64,
    pub is_compressed: bool,
    /// Uncompressed payload size; the receiver asserts it after inflation.
    pub size: u32,
    pub compressed_size: u32,
    pub payload: Vec<u8>,
}

/// Encode a message into its wire form, compressing large payloads.
pub fn seal(
    sender: &Sender,
    host: &HostSpec,
    id: u64,
    msg: &ClusterMsg,
) -> Result<Vec<u8>, EnvelopeError> {
    let plain = postcard::to_allocvec(msg)?;
    let size = plain.len() as u32;

    let (payload, is_compressed, compressed_size) = if plain.len() > COMPRESS_THRESHOLD {
        let packed = lz4_flex::block::compress(&plain);
        let clen = packed.len() as u32;
        (packed, true, clen)
    } else {
        (plain, false, 0)
    };

    let envelope = Envelope {
        sender: sender.clone(),
        host: host.clone(),
        class: msg.command().to_string(),
        id,
        is_compressed,
        size,
        compressed_size,
        payload,
    };
    Ok(postcard::to_allocvec(&envelope)?)
}

/// Decode an envelope off the bus. Returns `None` when the message is
/// addressed to a different host.
pub fn open(
    bytes: &[u8],
    local_id: NodeId,
) -> Result<Option<(Envelope, ClusterMsg)>, EnvelopeError> {
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(EnvelopeError::TooLarge(bytes.len()));
    }
    let envelope: Envelope = postcard::from_bytes(bytes)?;

    if let Some(host_id) = envelope.host.id {
        if host_id != local_id {
            debug!(
                "Dropping {} message {} addressed to node {}",
                envelope.class, envelope.id, host_id
            );
            return Ok(None);
        }
    }

    let declared = envelope.size as usize;
    let plain;
    let payload: &[u8] = if envelope.is_compressed {
        plain = lz4_flex::block::decompress(&envelope.payload, declared)?;
        if plain.len() != declared {
            return Err(EnvelopeError::SizeMismatch {
                declared,
                got: plain.len(),
            });
        }
        &plain
    } else {
        &envelope.payload
    };

    let msg: ClusterMsg = postcard::from_bytes(payload)?;
    Ok(Some((envelope, msg)))
}
