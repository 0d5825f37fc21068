// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Parked long-poll requests.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::Notification;

/// One parked poll, completable exactly once.
///
/// Wakeups may race each other (two keys of the same waiter firing close
/// together) and race the timeout; whoever takes the sender wins, the rest
/// are no-ops.
pub struct Waiter {
    pub(super) id: u64,
    /// Watched key -> namespace the client asked about under that key.
    pub(super) namespace_by_key: HashMap<String, String>,
    sender: Mutex<Option<oneshot::Sender<Vec<Notification>>>>,
}

impl Waiter {
    pub(super) fn new(
        id: u64,
        namespace_by_key: HashMap<String, String>,
    ) -> (Self, oneshot::Receiver<Vec<Notification>>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Self { id, namespace_by_key, sender: Mutex::new(Some(tx)) };
        (waiter, rx)
    }

    /// Deliver notifications; returns false if already completed or the
    /// client went away.
    pub(super) fn complete(&self, notifications: Vec<Notification>) -> bool {
        match self.sender.lock().take() {
            Some(tx) => tx.send(notifications).is_ok(),
            None => false,
        }
    }
}
