//! Interview sessions: records, the store seam and the orchestrator.

pub mod model;
pub mod orchestrator;
pub mod store;

pub use model::{
    ContentItem, ContentKind, ContentPatch, ContentStatus, ContentSummary, Exchange,
    ExchangeRole, Session, SessionPatch,
};
pub use orchestrator::{
    DeliveryMode, SessionOrchestrator, SessionState, StartSessionInput, Stores,
};
pub use store::{MemoryStore, Record, RecordStore};
