// Groupcast — connect a WhatsApp account through a partner gateway, discover
// the groups it administers, and broadcast to them.
//
// Layers:
//   atoms  — constants, domain types, error taxonomy (no I/O)
//   engine — gateway client, store, lifecycle controller, sync engine,
//            progress tracker, reaper, plan gate, service facade

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult, ErrorClass, ErrorKind, GatewayError};
pub use atoms::types::{
    AdminStatus, Channel, ChannelMode, ChannelStatus, Group, PlanStatus, SyncPhase, SyncProgress,
    SyncStatus,
};
pub use engine::config::EngineConfig;
pub use engine::service::{ChannelView, GroupcastService};
