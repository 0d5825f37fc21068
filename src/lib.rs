//! # Config Relay
//!
//! Centralized configuration distribution: publish once, converge
//! everywhere within seconds.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Release Engine                         │
//! │  • Publish / branch / merge / rollback state machine        │
//! │  • Exactly one bus message per mutating operation           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (append message row)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  DB-Backed Message Bus                      │
//! │  • Ordered message table, monotonic ids                     │
//! │  • Scanner tails the table, fans out to listeners           │
//! │  • Cleanup worker reaps superseded rows                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              (listeners, registration order)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Mirroring Caches                          │
//! │  • Message cache: newest notification id per watch key      │
//! │  • Namespace meta cache: three lookup indices + rebuild     │
//! │  • Gray rule cache: forward pinning + reverse existence     │
//! │  • Release cache: two-keyed, idle-expired, warm-on-event    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Long-Poll Notification Hub                    │
//! │  • Waiters parked under exact watch keys                    │
//! │  • Immediate answer when the cache is already ahead         │
//! │  • Paced batch wakeups on hot keys                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use config_relay::{ConfigRelay, MemoryStore, PublishRequest, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     store
//!         .seed_namespace("my-app", "default", "application", false)
//!         .await
//!         .unwrap();
//!
//!     let relay = Arc::new(ConfigRelay::new(store, ServiceConfig::default()).await.unwrap());
//!     relay.start().await.unwrap();
//!
//!     // Publish the namespace's current items as a release.
//!     let release = relay
//!         .engine
//!         .publish(&PublishRequest {
//!             app_id: "my-app".into(),
//!             cluster: "default".into(),
//!             namespace: "application".into(),
//!             operator: "ops".into(),
//!             is_emergency: false,
//!         })
//!         .await
//!         .unwrap();
//!     println!("released {}", release.release_key);
//!
//!     relay.shutdown();
//! }
//! ```

pub mod bus;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gray;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod resolver;
pub mod service;
pub mod store;

pub use config::ServiceConfig;
pub use engine::{PublishRequest, ReleaseEngine};
pub use error::{Error, Result};
pub use hub::{ClientNotification, Notification, NotificationHub, PollOutcome, PollRequest};
pub use model::{Release, ReleaseMessage};
pub use resolver::{ConfigRequest, ConfigResolver, ResolveOutcome};
pub use service::{ConfigRelay, ServiceState};
pub use store::MemoryStore;
