//! Ledger gateway integration
//!
//! This module provides the boundary to the authoritative ledger: the `LedgerGateway` trait
//! (submit, evaluate and the block-ordered event feed), an HTTP + WebSocket client for it,
//! and the typed queries the sync core runs against it.

/// HTTP + WebSocket client for the ledger gateway
mod client;
/// Typed evaluate queries
mod queries;
/// Type definitions for the gateway boundary
mod types;

pub use client::LedgerGatewayClient;
pub use queries::{LedgerQueries, QueryError};
pub use types::*;
