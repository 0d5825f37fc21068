// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store-mirroring caches.
//!
//! Both caches follow the same pattern: a blocking full load at startup,
//! then incremental catch-up (bus events or tail scans) with a periodic
//! reconciliation pass to absorb anything the incremental path missed.

pub mod message;
pub mod meta;

pub use message::MessageCache;
pub use meta::NamespaceMetaCache;
