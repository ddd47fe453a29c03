//! Configuration for replication sessions.

use crate::backoff::BackoffPolicy;
use crate::error::{SyncError, SyncResult};
use docsync_protocol::FeedMode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Filter name used by Sync Gateway for channel-based pulls.
pub const BY_CHANNEL_FILTER: &str = "sync_gateway/bychannel";

/// Filter parameter carrying the comma-separated channel list.
pub const CHANNELS_PARAM: &str = "channels";

/// Direction of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl Direction {
    /// Returns true for push replications.
    pub fn is_push(&self) -> bool {
        matches!(self, Direction::Push)
    }
}

/// Configuration for one replication session.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Remote database URL.
    pub remote: Url,
    /// Replication direction.
    pub direction: Direction,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Filter function name.
    pub filter: Option<String>,
    /// Filter parameters.
    pub filter_params: Option<BTreeMap<String, Value>>,
    /// Restrict the replication to these document IDs.
    pub doc_ids: Option<Vec<String>>,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Create the remote database on push if it does not exist.
    pub create_target: bool,
    /// Change feed settings.
    pub feed: FeedConfig,
    /// Revision batching settings.
    pub batcher: BatcherConfig,
    /// Backoff for the change feed.
    pub backoff: BackoffPolicy,
    /// Maximum number of concurrent network requests.
    pub request_pool_size: usize,
}

impl ReplicationConfig {
    /// Creates a configuration for the given remote database.
    ///
    /// Fails for URLs that cannot be parsed or that use a scheme other than
    /// `http` or `https`.
    pub fn new(remote: &str, direction: Direction) -> SyncResult<Self> {
        let remote = Url::parse(remote)
            .map_err(|e| SyncError::Configuration(format!("invalid remote url: {e}")))?;
        Self::from_url(remote, direction)
    }

    /// Creates a configuration from an already parsed URL.
    pub fn from_url(remote: Url, direction: Direction) -> SyncResult<Self> {
        if !matches!(remote.scheme(), "http" | "https") {
            return Err(SyncError::Configuration(format!(
                "unsupported scheme `{}`",
                remote.scheme()
            )));
        }
        if remote.cannot_be_a_base() || remote.host_str().is_none() {
            return Err(SyncError::Configuration(format!(
                "remote url `{remote}` has no host"
            )));
        }

        Ok(Self {
            remote,
            direction,
            continuous: false,
            filter: None,
            filter_params: None,
            doc_ids: None,
            headers: BTreeMap::new(),
            create_target: false,
            feed: FeedConfig::default(),
            batcher: BatcherConfig::default(),
            backoff: BackoffPolicy::default(),
            request_pool_size: 5,
        })
    }

    /// Makes the replication continuous.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the filter function and its parameters.
    pub fn with_filter(
        mut self,
        filter: impl Into<String>,
        params: Option<BTreeMap<String, Value>>,
    ) -> Self {
        self.filter = Some(filter.into());
        self.filter_params = params;
        self
    }

    /// Restricts the replication to the given document IDs.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Creates the remote database on push if it is missing.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the change feed configuration.
    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }

    /// Sets the batcher configuration.
    pub fn with_batcher(mut self, batcher: BatcherConfig) -> Self {
        self.batcher = batcher;
        self
    }

    /// Sets the change feed backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the number of concurrent network requests (at least 1).
    pub fn with_request_pool_size(mut self, size: usize) -> Self {
        self.request_pool_size = size.max(1);
        self
    }

    /// Pulls only the given Sync Gateway channels.
    ///
    /// Ignored for push replications. An empty list clears a channel filter.
    pub fn with_channels(mut self, channels: &[&str]) -> Self {
        if self.direction.is_push() {
            return self;
        }
        if channels.is_empty() {
            if self.filter.as_deref() == Some(BY_CHANNEL_FILTER) {
                self.filter = None;
                self.filter_params = None;
            }
            return self;
        }
        let mut params = BTreeMap::new();
        params.insert(CHANNELS_PARAM.to_owned(), Value::String(channels.join(",")));
        self.filter = Some(BY_CHANNEL_FILTER.to_owned());
        self.filter_params = Some(params);
        self
    }

    /// Channels pulled by a Sync Gateway channel filter, if one is set.
    pub fn channels(&self) -> Vec<String> {
        if self.direction.is_push() || self.filter.as_deref() != Some(BY_CHANNEL_FILTER) {
            return Vec::new();
        }
        self.filter_params
            .as_ref()
            .and_then(|params| params.get(CHANNELS_PARAM))
            .and_then(Value::as_str)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Feed mode used for a pull with this configuration.
    pub fn feed_mode(&self) -> FeedMode {
        if self.continuous {
            self.feed.continuous_mode
        } else {
            FeedMode::OneShot
        }
    }
}

/// Change feed settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Mode used for continuous pulls (`Continuous` or `LongPoll`).
    pub continuous_mode: FeedMode,
    /// Heartbeat interval requested from the server.
    pub heartbeat: Duration,
    /// Page size for long-poll requests.
    pub longpoll_limit: u32,
}

impl FeedConfig {
    /// Sets the mode used for continuous pulls.
    pub fn with_continuous_mode(mut self, mode: FeedMode) -> Self {
        self.continuous_mode = mode;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the long-poll page size.
    pub fn with_longpoll_limit(mut self, limit: u32) -> Self {
        self.longpoll_limit = limit;
        self
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            continuous_mode: FeedMode::Continuous,
            heartbeat: Duration::from_millis(300_000),
            longpoll_limit: 50,
        }
    }
}

/// Revision batching settings.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Number of items that flushes a batch immediately.
    pub capacity: usize,
    /// Delay after the first unflushed item before a partial batch flushes.
    pub delay: Duration,
}

impl BatcherConfig {
    /// Creates a batcher configuration. A zero capacity is treated as 1.
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            delay,
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_config_builder() {
        let config = ReplicationConfig::new("https://sync.example.com/db", Direction::Pull)
            .unwrap()
            .with_continuous(true)
            .with_doc_ids(vec!["a".into()])
            .with_header("X-Trace", "1")
            .with_request_pool_size(0);

        assert_eq!(config.remote.as_str(), "https://sync.example.com/db");
        assert!(config.continuous);
        assert_eq!(config.doc_ids.as_deref(), Some(&["a".to_string()][..]));
        assert_eq!(config.headers.get("X-Trace").map(String::as_str), Some("1"));
        assert_eq!(config.request_pool_size, 1);
        assert_eq!(config.feed_mode(), FeedMode::Continuous);
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(
            ReplicationConfig::new("not a url", Direction::Pull),
            Err(SyncError::Configuration(_))
        ));
        assert!(ReplicationConfig::new("ftp://host/db", Direction::Push).is_err());
        assert!(ReplicationConfig::new("mailto:someone@example.com", Direction::Push).is_err());
    }

    #[test]
    fn defaults() {
        let config = ReplicationConfig::new("http://localhost:5984/db", Direction::Push).unwrap();
        assert_eq!(config.request_pool_size, 5);
        assert_eq!(config.batcher.capacity, 100);
        assert_eq!(config.batcher.delay, Duration::from_millis(500));
        assert_eq!(config.feed.heartbeat, Duration::from_millis(300_000));
        assert_eq!(config.feed.longpoll_limit, 50);
        assert_eq!(config.feed_mode(), FeedMode::OneShot);
    }

    #[test]
    fn channels_round_trip_on_pull() {
        let config = ReplicationConfig::new("http://localhost/db", Direction::Pull)
            .unwrap()
            .with_channels(&["news", "sports"]);
        assert_eq!(config.filter.as_deref(), Some(BY_CHANNEL_FILTER));
        assert_eq!(config.channels(), vec!["news".to_string(), "sports".to_string()]);

        let cleared = config.with_channels(&[]);
        assert!(cleared.filter.is_none());
        assert!(cleared.channels().is_empty());
    }

    #[test]
    fn channels_ignored_on_push() {
        let config = ReplicationConfig::new("http://localhost/db", Direction::Push)
            .unwrap()
            .with_channels(&["news"]);
        assert!(config.filter.is_none());
        assert!(config.channels().is_empty());
    }

    #[test]
    fn continuous_mode_override() {
        let config = ReplicationConfig::new("http://localhost/db", Direction::Pull)
            .unwrap()
            .with_continuous(true)
            .with_feed(FeedConfig::default().with_continuous_mode(FeedMode::LongPoll));
        assert_eq!(config.feed_mode(), FeedMode::LongPoll);
    }
}
