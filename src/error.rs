// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service-level error taxonomy.
//!
//! Scanners and caches recover locally from transient store failures and
//! data corruption (skip-and-continue); only the state-machine operations
//! and request validation surface errors to callers.

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing namespace/release/branch.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid operation or malformed input, rejected before any write.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Store failure surfaced from a state-machine operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn bad_request(why: impl Into<String>) -> Self {
        Error::BadRequest(why.into())
    }
}
