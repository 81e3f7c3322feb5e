//! # wlf-sync: Shared-state rooms over WebSocket
//!
//! Participants join named rooms and co-edit one JSON document per room,
//! under a per-room access lattice. Rooms are cached in memory, persisted
//! in the background and evicted after an idle grace period.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Reconciler  │                     │RoomDirectory│
//! │ + EventBus  │                     │ key → Room  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ PersistQueue  │
//!                                    │ → RoomStore   │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`access`]: Owner/admin/write/join lattice
//! - [`room`]: Document, roster and command handling for one room
//! - [`session`]: One connected participant and its outbound queue
//! - [`directory`]: Room cache with single-flight hydration and eviction
//! - [`storage`]: Room stores (memory, RocksDB) and the persistence queue
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with a reconciled local mirror

pub mod access;
pub mod client;
pub mod config;
pub mod directory;
pub mod identity;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;
pub mod value;

// Re-exports for convenience
pub use access::{AccessControl, AccessSnapshot};
pub use client::{
    ClientError, ConnectionState, EventBus, ReconcileEvent, Reconciler, SubscriptionId,
    SyncClient, SyncEvent, Topic,
};
pub use config::{ConfigError, PersistConfig, RoomConfig, ServerConfig};
pub use directory::{RoomDirectory, RoomHandle};
pub use identity::{Identity, IdentityTokens, StableId};
pub use protocol::{ClientCommand, Envelope, ProtocolError, ServerEvent};
pub use room::{validate_document, Room, RoomHooks, RoomRecord};
pub use server::{ServerStats, SyncServer};
pub use session::Session;
pub use storage::{
    MemoryStore, PersistQueue, PersistStats, RocksStore, RoomMetadata, RoomStore, StoreConfig,
    StoreError,
};
