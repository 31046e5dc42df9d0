// Engine configuration. Loaded by an external collaborator and passed in at
// construction; the core never reads environment or files by itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::canonical::CanonicalRules;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub governor: GovernorConfig,
    pub fetcher: FetcherConfig,
    pub ssrf: SsrfConfig,
    pub quality: QualityConfig,
    pub resolver: ResolverConfig,
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub canonical: CanonicalRules,
}

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Per-host rewrite rules yielding a direct content URL. The value is a
    /// template; `{path}` expands to the canonical URL's path.
    pub known_hosts: HashMap<String, String>,
    /// Aggregator URL templates for podcast episodes. `{show}` and
    /// `{episode}` expand to slugs.
    pub aggregator_templates: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Enqueue blocks until queue depth drops below the low-water mark.
    Block,
    /// Enqueue returns `Rejected(backpressure)`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub lease_ttl: Duration,
    pub max_attempts: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fraction of the computed backoff applied as +/- jitter.
    pub backoff_jitter: f64,
    pub high_water: i64,
    pub low_water: i64,
    pub admission: AdmissionPolicy,
    pub lease_batch_size: i64,
    /// Idle sleep between empty lease polls.
    pub poll_interval: Duration,
    /// Per-reference budget summed across attempts.
    pub time_budget: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease_ttl: Duration::from_secs(120),
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            backoff_jitter: 0.2,
            high_water: 10_000,
            low_water: 8_000,
            admission: AdmissionPolicy::Reject,
            lease_batch_size: 16,
            poll_interval: Duration::from_secs(1),
            time_budget: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostOverride {
    pub rate: f64,
    pub burst: u32,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub threshold: u32,
    pub cooldown_base: Duration,
    pub cooldown_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_base: Duration::from_secs(60),
            cooldown_cap: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Tokens per second refilled into each host bucket.
    pub default_rate: f64,
    pub default_burst: u32,
    pub default_max_concurrent: usize,
    pub per_host: HashMap<String, HostOverride>,
    pub breaker: BreakerConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            default_burst: 4,
            default_max_concurrent: 2,
            per_host: HashMap::new(),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub total_timeout: Duration,
    /// Hard cap on response bytes. A body at exactly the cap succeeds.
    pub size_cap: u64,
    pub redirect_cap: usize,
    pub user_agent: String,
    /// Bound on merged locators per reference.
    pub locator_cap: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            size_cap: 10 * 1024 * 1024,
            redirect_cap: 10,
            user_agent: "scrivener/0.1".to_string(),
            locator_cap: 8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SsrfConfig {
    /// Test-only escape hatch: permit loopback/private targets.
    pub allow_private: bool,
    /// Hosts exempt from the private-range rejection.
    pub allow_list: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub min_bytes: u64,
    pub min_words_article: u64,
    pub min_words_transcript: u64,
    /// Two or more matches mark bad(paywall); exactly one degrades to marginal.
    pub paywall_patterns: Vec<String>,
    pub js_block_patterns: Vec<String>,
    /// Bodies above this word count are exempt from the js-block rule.
    pub js_block_word_exemption: u64,
    /// Host -> body patterns that mark a 200 response as a soft 404.
    pub soft404_host_patterns: HashMap<String, Vec<String>>,
    /// Patterns applied to every host.
    pub soft404_patterns: Vec<String>,
    /// Whether marginal artifacts satisfy dedup against new submissions.
    pub marginal_dedup: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_bytes: 500,
            min_words_article: 100,
            min_words_transcript: 500,
            paywall_patterns: vec![
                "subscribe to continue".into(),
                "subscription required".into(),
                "sign in to keep reading".into(),
                "already a subscriber".into(),
                "this article is for subscribers".into(),
            ],
            js_block_patterns: vec![
                "enable javascript".into(),
                "javascript is required".into(),
                "please turn on javascript".into(),
            ],
            js_block_word_exemption: 5000,
            soft404_host_patterns: HashMap::new(),
            soft404_patterns: vec![
                "page not found".into(),
                "this content is no longer available".into(),
            ],
            marginal_dedup: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/archive"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/index.db"),
        }
    }
}
