pub mod engine;
pub mod scheduler;
mod worker;

pub use engine::{Collaborators, Engine, EngineHandle, ObservedReference};
pub use scheduler::backoff_delay;

// The operational boundary re-exported, so collaborators depend on one crate.
pub use scrivener_archive::{
    feed, CancelToken, CredentialProvider, EnrichOutcome, EnrichmentHook, NoCredentials,
    NoEnrichment, NoSearch, RequestOverlay, Resolver, SearchHit, SearchProvider,
};
pub use scrivener_common::{
    CommittedArtifact, EngineConfig, EnqueueOutcome, EnqueueRequest, Quality, Reference,
    ReferenceId, ReferenceKind, RejectReason, Stage,
};
