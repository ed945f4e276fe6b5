//! Block types for WeiSyn
//!
//! The consensus core routes and stores blocks but never interprets the
//! body; transactions are opaque payloads produced and validated elsewhere.

use bytes::Bytes;
use wes_primitives::H256;

/// Block header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block number (height)
    pub height: u64,
    /// Parent block hash
    pub previous_hash: H256,
    /// Block timestamp (Unix seconds)
    pub timestamp: u64,
    /// PoW difficulty target
    pub difficulty: u64,
    /// Chain identifier
    pub chain_id: u64,
    /// PoW nonce
    pub nonce: u64,
}

/// Block body containing transactions
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockBody {
    /// Ordered transaction payloads, opaque to the consensus core
    pub transactions: Vec<Transaction>,
}

/// An opaque transaction payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction(pub Bytes);

impl Transaction {
    /// Create a transaction from raw bytes
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Transaction(payload.into())
    }

    /// Raw payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Complete block (header + body)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Block body
    pub body: BlockBody,
}

impl Block {
    /// Create a new block
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    /// Block height shortcut
    pub fn height(&self) -> u64 {
        self.header.height
    }
}
