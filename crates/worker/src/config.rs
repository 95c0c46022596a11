//! Worker runtime configuration.
//!
//! Everything is environment-driven with sensible defaults, so a worker can
//! start with nothing but a Redis URL. Builder methods exist for tests and
//! embedders; env names match what the producers' deployment already sets.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Lower bound for the ack flush interval.
pub const ACK_FLUSH_FLOOR: Duration = Duration::from_millis(50);

/// Which partitions this worker consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSpec {
    /// One named partition.
    Single(String),
    /// An explicit list.
    List(Vec<String>),
    /// A generated set `{prefix}:0 … {prefix}:{count-1}`.
    Prefixed { prefix: String, count: u32 },
}

impl PartitionSpec {
    /// Expand to the concrete partition names, in consumption order.
    pub fn resolve(&self) -> Vec<String> {
        match self {
            PartitionSpec::Single(name) => vec![name.clone()],
            PartitionSpec::List(names) => names.clone(),
            PartitionSpec::Prefixed { prefix, count } => {
                (0..*count).map(|i| format!("{prefix}:{i}")).collect()
            }
        }
    }

    fn first(&self) -> String {
        self.resolve()
            .into_iter()
            .next()
            .unwrap_or_else(|| "stream:preprocess".to_string())
    }
}

/// Full worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub redis_password: Option<String>,
    pub partitions: PartitionSpec,
    /// Consumer group shared by every worker of this deployment.
    pub group: String,
    /// How long one blocking read may wait for new entries.
    pub block: Duration,
    /// Entries requested per partition per read.
    pub batch_count: usize,
    /// Idle time after which a pending entry becomes reclaimable.
    pub visibility_timeout: Duration,
    /// General attempt budget before dead-lettering.
    pub max_retry: u32,
    /// Dead-letter partition; derived from the first partition when unset.
    pub dlq_partition: Option<String>,
    /// Dedicated budget for an unreachable upstream source.
    pub source_retry_limit: u32,
    /// Delay before requeueing an unreachable-source entry.
    pub source_retry_delay: Duration,
    /// Whether acknowledgments are coalesced.
    pub batch_ack: bool,
    /// Flush period for batched acknowledgments (floored at 50 ms).
    pub ack_flush_interval: Duration,
    /// Concurrency gate size.
    pub max_concurrency: usize,
    /// Whether the memory guard is consulted before each job.
    pub memory_guard: bool,
    /// Period of the stale-entry reclamation loop.
    pub reclaim_interval: Duration,
    /// Entries reclaimed per partition per pass.
    pub reclaim_batch_limit: usize,
    /// Fixed sleep after a transport error in the consumption loop.
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_grace: Duration,
    /// Object-key prefix for exported artifacts.
    pub upload_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            redis_password: None,
            partitions: PartitionSpec::Single("stream:preprocess".to_string()),
            group: "workers".to_string(),
            block: Duration::from_millis(5000),
            batch_count: 20,
            visibility_timeout: Duration::from_secs(300),
            max_retry: 3,
            dlq_partition: None,
            source_retry_limit: 3,
            source_retry_delay: Duration::from_secs(30),
            batch_ack: true,
            ack_flush_interval: Duration::from_millis(200),
            max_concurrency: 2,
            memory_guard: true,
            reclaim_interval: Duration::from_secs(30),
            reclaim_batch_limit: 10,
            error_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            upload_prefix: "preprocess/".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load from environment variables, falling back to defaults. A value
    /// that fails to parse is reported and the default kept; configuration
    /// problems should not take the worker down.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("REDIS_URL") {
            config.redis_url = url;
        }
        config.redis_password = env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());

        let stream = env::var("REDIS_STREAM")
            .unwrap_or_else(|_| "stream:preprocess".to_string());
        let partition_count = env_parse::<u32>("REDIS_STREAM_PARTITIONS", 0);
        config.partitions = if partition_count > 0 {
            PartitionSpec::Prefixed {
                prefix: stream,
                count: partition_count,
            }
        } else if stream.contains(',') {
            PartitionSpec::List(
                stream
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )
        } else {
            PartitionSpec::Single(stream)
        };

        if let Ok(group) = env::var("REDIS_GROUP") {
            config.group = group;
        }
        config.block = Duration::from_millis(env_parse("REDIS_BLOCK_MS", 5000));
        config.batch_count = env_parse("REDIS_BATCH_COUNT", 20);
        config.visibility_timeout =
            Duration::from_secs(env_parse("REDIS_VISIBILITY_TIMEOUT", 300));
        config.max_retry = env_parse("REDIS_MAX_RETRY", 3);
        config.dlq_partition = env::var("REDIS_DLQ_STREAM").ok().filter(|s| !s.is_empty());
        config.source_retry_limit = env_parse("SOURCE_RETRY_LIMIT", 3);
        config.source_retry_delay = Duration::from_secs(env_parse("SOURCE_RETRY_DELAY_SECS", 30));
        config.batch_ack = env_parse("BATCH_ACK", true);
        config.ack_flush_interval = Duration::from_millis(env_parse("ACK_FLUSH_MS", 200));
        config.max_concurrency = env_parse("MAX_CONCURRENCY", 2).max(1);
        config.memory_guard = env_parse("MEMORY_GUARD", true);
        config.reclaim_interval = Duration::from_secs(env_parse("RECLAIM_INTERVAL_SECS", 30));
        config.error_backoff = Duration::from_secs(env_parse("ERROR_BACKOFF_SECS", 5));
        config.shutdown_grace = Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30));
        if let Ok(prefix) = env::var("UPLOAD_PREFIX") {
            config.upload_prefix = prefix;
        }

        config
    }

    /// Redis connection URL with the password spliced in when configured
    /// separately (the deployment convention for this worker's producers).
    pub fn connection_url(&self) -> String {
        match &self.redis_password {
            Some(password) => match self.redis_url.split_once("://") {
                Some((scheme, rest)) => format!("{scheme}://:{password}@{rest}"),
                None => self.redis_url.clone(),
            },
            None => self.redis_url.clone(),
        }
    }

    /// The dead-letter partition: configured, or `{first partition}:dlq`.
    pub fn dlq_partition(&self) -> String {
        self.dlq_partition
            .clone()
            .unwrap_or_else(|| format!("{}:dlq", self.partitions.first()))
    }

    /// Flush interval with the 50 ms floor applied.
    pub fn ack_flush_interval(&self) -> Duration {
        self.ack_flush_interval.max(ACK_FLUSH_FLOOR)
    }

    pub fn with_partitions(mut self, partitions: PartitionSpec) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_dlq_partition(mut self, dlq: impl Into<String>) -> Self {
        self.dlq_partition = Some(dlq.into());
        self
    }

    pub fn with_source_retry(mut self, limit: u32, delay: Duration) -> Self {
        self.source_retry_limit = limit;
        self.source_retry_delay = delay;
        self
    }

    pub fn with_batch_ack(mut self, enabled: bool) -> Self {
        self.batch_ack = enabled;
        self
    }

    pub fn with_ack_flush_interval(mut self, interval: Duration) -> Self {
        self.ack_flush_interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_memory_guard(mut self, enabled: bool) -> Self {
        self.memory_guard = enabled;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, "unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
