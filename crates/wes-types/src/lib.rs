//! # wes-types
//!
//! Block and chain types for the WeiSyn consensus layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block;
mod chain;

pub use block::{Block, BlockBody, BlockHeader, Transaction};
pub use chain::ChainInfo;
