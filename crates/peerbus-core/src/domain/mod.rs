//! Domain Layer - protocol state with no I/O
//!
//! - Local event emitter (exact, namespace and global matching)
//! - Origin allow-list
//! - Vector clocks and the causal delivery buffer
//! - Peer registry, router and offline queues
//! - Pending request correlation
//! - Handshake state machine
//! - Inbound/outbound hook pipeline
//! - Per-handler security gate

pub mod clock;
pub mod emitter;
pub mod handshake;
pub mod hooks;
pub mod origin;
pub mod pending;
pub mod registry;
pub mod security;

pub use clock::{CausalDelivery, CausalOrder, CausalOrderer, CausalOverflow, VectorClock};
pub use emitter::{
    BusEvent, DispatchMode, EventEmitter, EventPattern, EventSource, ListenerId, ListenerOptions,
    OffResult, Subscription,
};
pub use handshake::{HandshakeRole, HandshakeState, HandshakeStep, Handshakes};
pub use hooks::{FnHook, Hook, HookContext, HookDirection, HookId, HookPipeline, DEFAULT_HOOK_PRIORITY};
pub use origin::{OriginPatternError, OriginValidator};
pub use pending::{PendingHandle, PendingOptions, PendingRequests, PendingStats};
pub use registry::{
    DrainReport, PeerInfo, PeerOptions, PeerRegistry, PeerStatus, RouteOptions, RouteResult, SendFn,
};
pub use security::{HandlerSecurity, PayloadValidator, RateLimiter};
