// Shared domain types: references, stages, locators, artifacts, outcomes.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content_hash;

/// What kind of content a reference points at. Drives per-kind quality floors
/// and the resolver predicate filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    PodcastEpisode,
    Article,
    Newsletter,
    Document,
    GenericUrl,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::PodcastEpisode => "podcast_episode",
            ReferenceKind::Article => "article",
            ReferenceKind::Newsletter => "newsletter",
            ReferenceKind::Document => "document",
            ReferenceKind::GenericUrl => "generic_url",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "podcast_episode" => Some(ReferenceKind::PodcastEpisode),
            "article" => Some(ReferenceKind::Article),
            "newsletter" => Some(ReferenceKind::Newsletter),
            "document" => Some(ReferenceKind::Document),
            "generic_url" => Some(ReferenceKind::GenericUrl),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity for a reference, derived from (kind, canonical_url).
/// The same submission always maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    /// Derive the id from a kind and an already-canonicalized URL.
    pub fn derive(kind: ReferenceKind, canonical_url: &str) -> Self {
        let digest = content_hash(format!("{}\n{}", kind.as_str(), canonical_url).as_bytes());
        // 128 bits of the digest is plenty for identity and keeps paths short.
        ReferenceId(digest[..32].to_string())
    }

    /// Wrap a raw id read back from the index.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        ReferenceId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle stage. Stored as an integer only at the persistence boundary.
///
/// Active stages are 100..590; 590/599 are terminal-good; the remaining
/// variants are sentinels stored above the active range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Accepted by an enqueue path.
    ContentReceived,
    /// A worker holds the lease.
    Leased,
    /// Resolver + fetch produced bytes.
    Fetched,
    /// Acquisition done, sidecar metadata assembled.
    Acquired,
    /// Verifier returned good or marginal.
    Verified,
    /// Content store directory committed.
    Stored,
    /// Post-acquisition hook completed.
    Enriched,
    /// Index updated with the content hash. Terminal-good.
    Finalized,
    /// Submission matched an existing terminal-good reference.
    Duplicate,
    /// Acquisition subphase failed, retry scheduled.
    AcquireFailed,
    /// Verification subphase failed, retry scheduled.
    VerifyFailed,
    /// Storage subphase failed, retry scheduled.
    StoreFailed,
    /// Enrichment subphase failed, retry scheduled.
    EnrichFailed,
    /// Server asked us to come back later. Not a fault.
    RateLimited,
    /// Classified permanent; parked in the dead-letter set.
    PermanentError,
    /// Internal bug or panic; untouched for safe retry.
    SystemError,
}

impl Stage {
    pub fn code(&self) -> i64 {
        match self {
            Stage::ContentReceived => 100,
            Stage::Leased => 110,
            Stage::AcquireFailed => 130,
            Stage::Fetched => 150,
            Stage::Acquired => 190,
            Stage::VerifyFailed => 230,
            Stage::Verified => 250,
            Stage::StoreFailed => 330,
            Stage::Stored => 390,
            Stage::EnrichFailed => 430,
            Stage::Enriched => 490,
            Stage::Finalized => 590,
            Stage::Duplicate => 599,
            Stage::PermanentError => 900,
            Stage::SystemError => 910,
            Stage::RateLimited => 920,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            100 => Some(Stage::ContentReceived),
            110 => Some(Stage::Leased),
            130 => Some(Stage::AcquireFailed),
            150 => Some(Stage::Fetched),
            190 => Some(Stage::Acquired),
            230 => Some(Stage::VerifyFailed),
            250 => Some(Stage::Verified),
            330 => Some(Stage::StoreFailed),
            390 => Some(Stage::Stored),
            430 => Some(Stage::EnrichFailed),
            490 => Some(Stage::Enriched),
            590 => Some(Stage::Finalized),
            599 => Some(Stage::Duplicate),
            900 => Some(Stage::PermanentError),
            910 => Some(Stage::SystemError),
            920 => Some(Stage::RateLimited),
            _ => None,
        }
    }

    /// Terminal-good: eligible to satisfy deduplication.
    pub fn is_terminal_good(&self) -> bool {
        matches!(self, Stage::Finalized | Stage::Duplicate)
    }

    /// In the active 100..590 range (including subphase failure marks).
    pub fn is_active(&self) -> bool {
        let c = self.code();
        (100..590).contains(&c)
    }

    /// A subphase failure mark awaiting its retry clock.
    pub fn is_retry_scheduled(&self) -> bool {
        matches!(
            self,
            Stage::AcquireFailed
                | Stage::VerifyFailed
                | Stage::StoreFailed
                | Stage::EnrichFailed
                | Stage::RateLimited
        )
    }

    /// Stages a fresh lease can start from.
    pub fn is_leasable(&self) -> bool {
        matches!(self, Stage::ContentReceived) || self.is_retry_scheduled()
    }

    /// The failure mark for a fault observed while in this stage.
    pub fn failure_mark(&self) -> Stage {
        match self {
            Stage::Verified => Stage::StoreFailed,
            Stage::Stored => Stage::EnrichFailed,
            Stage::Enriched => Stage::EnrichFailed,
            Stage::Acquired => Stage::VerifyFailed,
            _ => Stage::AcquireFailed,
        }
    }

    /// Whether `self -> to` is an allowed transition. Success transitions are
    /// monotonic; the only backward edges are retry-scheduled -> received and
    /// the explicit dead-letter resurrection.
    pub fn can_transition_to(&self, to: Stage) -> bool {
        use Stage::*;
        match (self, to) {
            (ContentReceived, Leased) => true,
            (Leased, Fetched) => true,
            (Fetched, Acquired) => true,
            (Acquired, Verified) => true,
            (Verified, Stored) => true,
            (Stored, Enriched) => true,
            (Enriched, Finalized) => true,
            // Subphase failure marks from any active stage.
            (from, AcquireFailed | VerifyFailed | StoreFailed | EnrichFailed) => from.is_active(),
            // Sentinels reachable from anywhere active.
            (from, RateLimited) => from.is_active(),
            (from, PermanentError | SystemError) => from.is_active(),
            // Retry clock reached: back to the ready pool.
            (from, ContentReceived) if from.is_retry_scheduled() => true,
            // Operator resurrection of a dead-letter item.
            (PermanentError, ContentReceived) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Stable reason code recorded alongside a failed or parked reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    ServerError,
    DnsSoftFail,
    GovernorDeferred,
    ResolverTransient,
    RateLimited,
    NotFound,
    Gone,
    LegalBlock,
    DisallowedScheme,
    UnfetchableHost,
    SsrfBlocked,
    SizeCap,
    RedirectCap,
    Soft404,
    VerifierBad,
    MaxAttempts,
    TimeBudget,
    StorageIntegrity,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::ServerError => "server_error",
            FailureReason::DnsSoftFail => "dns_soft_fail",
            FailureReason::GovernorDeferred => "governor_deferred",
            FailureReason::ResolverTransient => "resolver_transient",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::NotFound => "not_found",
            FailureReason::Gone => "gone",
            FailureReason::LegalBlock => "legal_block",
            FailureReason::DisallowedScheme => "disallowed_scheme",
            FailureReason::UnfetchableHost => "unfetchable_host",
            FailureReason::SsrfBlocked => "ssrf_blocked",
            FailureReason::SizeCap => "size_cap",
            FailureReason::RedirectCap => "redirect_cap",
            FailureReason::Soft404 => "soft_404",
            FailureReason::VerifierBad => "verifier_bad",
            FailureReason::MaxAttempts => "max_attempts",
            FailureReason::TimeBudget => "time_budget",
            FailureReason::StorageIntegrity => "storage_integrity",
            FailureReason::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let all = [
            FailureReason::Timeout,
            FailureReason::ServerError,
            FailureReason::DnsSoftFail,
            FailureReason::GovernorDeferred,
            FailureReason::ResolverTransient,
            FailureReason::RateLimited,
            FailureReason::NotFound,
            FailureReason::Gone,
            FailureReason::LegalBlock,
            FailureReason::DisallowedScheme,
            FailureReason::UnfetchableHost,
            FailureReason::SsrfBlocked,
            FailureReason::SizeCap,
            FailureReason::RedirectCap,
            FailureReason::Soft404,
            FailureReason::VerifierBad,
            FailureReason::MaxAttempts,
            FailureReason::TimeBudget,
            FailureReason::StorageIntegrity,
            FailureReason::Internal,
        ];
        all.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub kind: ReferenceKind,
    /// Original URL as received. Retained verbatim, may be unreachable.
    pub source_url: String,
    pub canonical_url: String,
    /// Governor key for this reference's host.
    pub host_key: String,
    /// Set once terminal-good is reached; null before.
    pub content_hash: Option<String>,
    pub stage: Stage,
    /// False for references whose scheme/host is structurally unfetchable.
    pub processable: bool,
    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    /// Higher runs earlier.
    pub priority: i64,
    pub attempts: i64,
    /// Cumulative processing time across attempts, for the per-reference budget.
    pub spent_ms: i64,
    pub ready_at: DateTime<Utc>,
    pub last_attempt_outcome: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// For stage-599 records: the terminal-good reference this duplicates.
    pub duplicate_of: Option<ReferenceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl Reference {
    /// When the next retry is due, if one is scheduled.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.stage.is_retry_scheduled().then_some(self.ready_at)
    }
}

/// How a locator's URL should be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportHint {
    /// Any transport, in cascade order.
    Any,
    Direct,
    Browser,
    Archive,
    Mirror,
}

/// Candidate content location produced by a resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Locator {
    pub url: String,
    pub transport_hint: TransportHint,
    pub source_resolver: String,
    /// In [0, 1]. Resolvers rank their own candidates with this.
    pub confidence: f64,
    pub auth_context: Option<String>,
}

/// The transport that produced the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    DirectHttp,
    DirectCookies,
    Browser,
    ArchiveIs,
    Wayback,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::DirectHttp => "direct_http",
            Transport::DirectCookies => "direct_cookies",
            Transport::Browser => "browser",
            Transport::ArchiveIs => "archive_is",
            Transport::Wayback => "wayback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct_http" => Some(Transport::DirectHttp),
            "direct_cookies" => Some(Transport::DirectCookies),
            "browser" => Some(Transport::Browser),
            "archive_is" => Some(Transport::ArchiveIs),
            "wayback" => Some(Transport::Wayback),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the artifact bytes ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObtainedFrom {
    Origin,
    ArchiveIs,
    Wayback,
    AlternateUrl,
}

impl ObtainedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObtainedFrom::Origin => "origin",
            ObtainedFrom::ArchiveIs => "archive_is",
            ObtainedFrom::Wayback => "wayback",
            ObtainedFrom::AlternateUrl => "alternate_url",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "origin" => Some(ObtainedFrom::Origin),
            "archive_is" => Some(ObtainedFrom::ArchiveIs),
            "wayback" => Some(ObtainedFrom::Wayback),
            "alternate_url" => Some(ObtainedFrom::AlternateUrl),
            _ => None,
        }
    }
}

/// Verifier classification of a produced artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Marginal,
    Bad,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Marginal => "marginal",
            Quality::Bad => "bad",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(Quality::Good),
            "marginal" => Some(Quality::Marginal),
            "bad" => Some(Quality::Bad),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityReason {
    TooSmall,
    Thin,
    Paywall,
    PaywallHint,
    Soft404,
    JsBlocked,
    NoParagraphs,
}

/// Metadata for a stored artifact. Bytes live in the content store; this is
/// what the index records at commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub reference_id: ReferenceId,
    pub content_hash: String,
    pub byte_count: u64,
    pub word_count: u64,
    pub quality: Quality,
    pub quality_reasons: Vec<QualityReason>,
    pub obtained_via: Transport,
    pub obtained_from: ObtainedFrom,
    pub source_resolver: String,
    pub final_url: String,
    pub content_path: PathBuf,
    pub fetched_at: DateTime<Utc>,
}

/// Submission handed to the enqueue interface.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub source_url: String,
    pub kind: ReferenceKind,
    pub priority: i64,
    pub metadata: Option<serde_json::Value>,
}

impl EnqueueRequest {
    pub fn new(source_url: impl Into<String>, kind: ReferenceKind) -> Self {
        Self {
            source_url: source_url.into(),
            kind,
            priority: 0,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DisallowedScheme,
    UnfetchableHost,
    Backpressure,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::DisallowedScheme => "disallowed_scheme",
            RejectReason::UnfetchableHost => "unfetchable_host",
            RejectReason::Backpressure => "backpressure",
        }
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    EnqueuedNew,
    /// An earlier dead-letter entry for this URL was re-armed.
    EnqueuedRetry,
    DuplicateOf(ReferenceId),
    Rejected(RejectReason),
}

/// One attempt's forensic record, kept (last N) for dead-letter replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptDiagnostic {
    pub attempt: i64,
    pub resolver: Option<String>,
    pub transport: Option<String>,
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Emitted on the change stream for every terminal-good commit.
/// Consumers must tolerate replays (idempotent by content_hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedArtifact {
    pub reference_id: ReferenceId,
    pub content_path: PathBuf,
    pub content_hash: String,
}
