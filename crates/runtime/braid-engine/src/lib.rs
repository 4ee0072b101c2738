//! braid-engine
//! The runtime layer over the Braid conversation DAG: mutation algebra,
//! snapshot materialization, the service facade, the privacy lifecycle, and
//! the export capsule format.

pub mod capsule;
pub mod dag;
pub mod privacy;
pub mod service;
pub mod snapshot;

pub use capsule::{
    export, import, CapsuleEntry, CapsuleError, CapsuleMode, CapsulePayload, ImportedCapsule,
    RenderStatus, RenderedCapsule,
};
pub use dag::{DagEngine, EngineError, LastWriterWins, MergePolicy};
pub use privacy::{KeyWrap, PrivacyError, PrivacyManager, RecipientKey, SharedEnvelope};
pub use service::{ConversationService, ConversationSummary};
pub use snapshot::{ConversationSnapshot, RenderedMessage, SnapshotStats};
