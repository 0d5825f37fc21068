// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database-backed message bus.
//!
//! Writers append rows to the message table through [`MessagePublisher`];
//! every node tails the table with a [`MessageScanner`] and fans new rows
//! out to its registered listeners. The table is the only channel between
//! the mutating side and the read-side caches, so ordering and durability
//! come for free from the store.

pub mod publisher;
pub mod scanner;

pub use publisher::MessagePublisher;
pub use scanner::MessageScanner;

use async_trait::async_trait;

use crate::model::ReleaseMessage;

/// A consumer of bus messages.
///
/// Implementations must tolerate duplicate and stale deliveries: the scanner
/// replays from its cursor after restarts and listeners may also observe the
/// same rows via their own catch-up scans. Failures are logged internally;
/// a listener never propagates errors into the scan loop.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &ReleaseMessage);
}
