//! Offline-first sync engine for two-party question threads.
//!
//! The engine keeps a local cache of threads and messages consistent with a
//! remote server through three paths:
//! - a live push channel ([`connection`]) with heartbeat, reconnect backoff
//!   and a durable outbox;
//! - paged pull reconciliation ([`reconcile`]) that merges server pages and
//!   prunes what the server no longer has;
//! - optimistic mutations ([`mutation`]) that write locally first and confirm
//!   or roll back.
//!
//! Every cache write funnels through one serialized [`worker::CacheWriter`];
//! per-entity [`locks::EntityLocks`] keep read-modify-write sequences on the
//! same thread from interleaving. [`engine::SyncEngine`] wires it together.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod locks;
pub mod mutation;
pub mod outbox;
pub mod pending;
pub mod reconcile;
pub mod worker;

pub use api::{HttpApi, StaticToken, SyncApi, TokenProvider};
pub use cache::{
    CacheChange, DeliveryStatus, DurableCache, MemoryCache, Message, PartitionScope, Thread,
};
pub use config::SyncConfig;
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Delivery, LiveChannel, LiveConnector,
    WsConnector,
};
pub use engine::{MemoryPressure, SyncEngine, SyncEngineBuilder, ViewScope};
pub use error::{ErrorCategory, SyncError, SyncResult, TransportKind};
pub use mutation::{MarkReadReport, MutationCoordinator, OperationClass};
pub use reconcile::{PageReport, PageRequest, PushApplier, Reconciler, SyncMode};

use parley_proto::Role;

/// The signed-in user and which side of threads they are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: i64, role: Role) -> Self {
        Self { user_id, role }
    }

    /// The slice of threads this user syncs: their own questions as an
    /// asker, the ones assigned to them as a responder.
    pub fn scope(&self) -> PartitionScope {
        match self.role {
            Role::Asker => PartitionScope::OwnedBy(self.user_id),
            Role::Responder => PartitionScope::AssignedTo(self.user_id),
        }
    }
}
