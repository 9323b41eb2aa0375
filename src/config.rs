use nutype::nutype;
use std::str::FromStr;
use std::time::Duration;

use crate::delay::RetryDelay;
use crate::error::Error;
use crate::retry::{AuthRetryPolicy, RetryPolicy};

/// Configuration for [`crate::execute`], the caller-side reload-and-retry loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecuteConfig {
    max_retries: u32,
    retry_delay: RetryDelay,
}

impl ExecuteConfig {
    pub fn with_max_retries(self, max_retries: u32) -> Result<Self, Error> {
        if max_retries == 0 {
            return Err(Error::invalid_config(
                "max_retries",
                "max_retries cannot be 0",
            ));
        }
        Ok(Self {
            max_retries,
            ..self
        })
    }

    pub fn with_base_delay(self, base_retry_delay_ms: u64) -> Result<Self, Error> {
        if base_retry_delay_ms == 0 {
            return Err(Error::invalid_config(
                "base_retry_delay_ms",
                "base_retry_delay_ms cannot be 0",
            ));
        }
        Ok(Self {
            retry_delay: self.retry_delay.with_base_delay(base_retry_delay_ms),
            ..self
        })
    }

    pub fn with_retry_delay(self, retry_delay: RetryDelay) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay
    }
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: RetryDelay::default(),
        }
    }
}

/// Name of a log topic, e.g. `project` or `csm.user.events`.
#[nutype(
    sanitize(trim),
    validate(
        not_empty,
        len_char_max = 249,
        predicate = |name: &str| name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    ),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Display, TryFrom)
)]
pub struct TopicName(String);

/// Name of a consumer group; each downstream service has its own.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Display, TryFrom)
)]
pub struct ConsumerGroup(String);

/// What a consumer does once retries for a message are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Halt the partition; completeness wins over availability.
    #[default]
    Transactional,
    /// Log, commit past the message and continue.
    NonTransactional,
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transactional" => Ok(DeliveryMode::Transactional),
            "non-transactional" | "non_transactional" | "nontransactional" => {
                Ok(DeliveryMode::NonTransactional)
            }
            other => Err(Error::invalid_config(
                "delivery_mode",
                format!("unknown delivery mode '{other}'"),
            )),
        }
    }
}

/// Resolved settings for one [`crate::ConsumerRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    topic: TopicName,
    group: ConsumerGroup,
    concurrency: usize,
    delivery_mode: DeliveryMode,
    max_poll_records: usize,
    poll_interval: Duration,
    retry_policy: RetryPolicy,
    auth_retry_policy: AuthRetryPolicy,
    missing_topics_fatal: bool,
}

impl ConsumerConfig {
    pub fn new(topic: TopicName, group: ConsumerGroup) -> Self {
        Self {
            topic,
            group,
            concurrency: 1,
            delivery_mode: DeliveryMode::default(),
            max_poll_records: 100,
            poll_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
            auth_retry_policy: AuthRetryPolicy::default(),
            missing_topics_fatal: false,
        }
    }

    /// Reads `KLIO_*` environment variables.
    ///
    /// `KLIO_TOPIC` and `KLIO_CONSUMER_GROUP` are required; everything else
    /// falls back to the defaults of [`ConsumerConfig::new`]:
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `KLIO_CONCURRENCY` | number of workers |
    /// | `KLIO_DELIVERY_MODE` | `transactional` or `non-transactional` |
    /// | `KLIO_MAX_POLL_RECORDS` | records fetched per poll |
    /// | `KLIO_POLL_INTERVAL_MS` | idle wait between polls |
    /// | `KLIO_RETRY_INITIAL_DELAY_MS` | first backoff delay |
    /// | `KLIO_RETRY_MULTIPLIER` | backoff multiplier |
    /// | `KLIO_RETRY_MAX_DELAY_MS` | backoff cap |
    /// | `KLIO_RETRY_MAX_ATTEMPTS` | attempt bound, `unbounded` to block until resolved |
    /// | `KLIO_AUTH_RETRY_INTERVAL_MS` | fixed wait after authentication failures |
    /// | `KLIO_MISSING_TOPICS_FATAL` | halt instead of waiting for a missing topic |
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| Error::invalid_config(name, format!("{name} is not set")))
        };
        let topic = TopicName::try_new(required("KLIO_TOPIC")?)
            .map_err(|e| Error::invalid_config("KLIO_TOPIC", e.to_string()))?;
        let group = ConsumerGroup::try_new(required("KLIO_CONSUMER_GROUP")?)
            .map_err(|e| Error::invalid_config("KLIO_CONSUMER_GROUP", e.to_string()))?;

        let mut config = Self::new(topic, group);

        if let Some(concurrency) = parse(&lookup, "KLIO_CONCURRENCY")? {
            config = config.with_concurrency(concurrency)?;
        }
        if let Some(mode) = parse(&lookup, "KLIO_DELIVERY_MODE")? {
            config = config.with_delivery_mode(mode);
        }
        if let Some(records) = parse(&lookup, "KLIO_MAX_POLL_RECORDS")? {
            config = config.with_max_poll_records(records)?;
        }
        if let Some(ms) = parse::<u64>(&lookup, "KLIO_POLL_INTERVAL_MS")? {
            config = config.with_poll_interval(Duration::from_millis(ms))?;
        }

        let defaults = config.retry_policy.delay();
        let initial = parse(&lookup, "KLIO_RETRY_INITIAL_DELAY_MS")?.unwrap_or(defaults.base_delay_ms());
        let multiplier = parse(&lookup, "KLIO_RETRY_MULTIPLIER")?.unwrap_or(defaults.multiplier());
        let cap = parse(&lookup, "KLIO_RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.max_delay_ms());
        if multiplier < 1.0 {
            return Err(Error::invalid_config(
                "KLIO_RETRY_MULTIPLIER",
                "multiplier must be at least 1.0",
            ));
        }
        let delay = RetryDelay::exponential(initial, multiplier, cap);
        let retry_policy = match lookup("KLIO_RETRY_MAX_ATTEMPTS") {
            Some(value) if value.trim().eq_ignore_ascii_case("unbounded") => {
                RetryPolicy::unbounded(delay)
            }
            Some(value) => {
                let attempts = value.trim().parse().map_err(|_| {
                    Error::invalid_config(
                        "KLIO_RETRY_MAX_ATTEMPTS",
                        format!("invalid attempt count '{value}'"),
                    )
                })?;
                RetryPolicy::bounded(delay, attempts)?
            }
            None => RetryPolicy::new(delay, config.retry_policy.attempts()),
        };
        config = config.with_retry_policy(retry_policy);

        if let Some(ms) = parse::<u64>(&lookup, "KLIO_AUTH_RETRY_INTERVAL_MS")? {
            config = config.with_auth_retry_policy(AuthRetryPolicy::new(Duration::from_millis(ms))?);
        }
        if let Some(fatal) = parse(&lookup, "KLIO_MISSING_TOPICS_FATAL")? {
            config = config.with_missing_topics_fatal(fatal);
        }

        Ok(config)
    }

    pub fn with_concurrency(self, concurrency: usize) -> Result<Self, Error> {
        if concurrency == 0 {
            return Err(Error::invalid_config(
                "concurrency",
                "concurrency cannot be 0",
            ));
        }
        Ok(Self {
            concurrency,
            ..self
        })
    }

    pub fn with_delivery_mode(self, delivery_mode: DeliveryMode) -> Self {
        Self {
            delivery_mode,
            ..self
        }
    }

    pub fn with_max_poll_records(self, max_poll_records: usize) -> Result<Self, Error> {
        if max_poll_records == 0 {
            return Err(Error::invalid_config(
                "max_poll_records",
                "max_poll_records cannot be 0",
            ));
        }
        Ok(Self {
            max_poll_records,
            ..self
        })
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Result<Self, Error> {
        if poll_interval.is_zero() {
            return Err(Error::invalid_config(
                "poll_interval",
                "poll_interval cannot be 0",
            ));
        }
        Ok(Self {
            poll_interval,
            ..self
        })
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }

    pub fn with_auth_retry_policy(self, auth_retry_policy: AuthRetryPolicy) -> Self {
        Self {
            auth_retry_policy,
            ..self
        }
    }

    pub fn with_missing_topics_fatal(self, missing_topics_fatal: bool) -> Self {
        Self {
            missing_topics_fatal,
            ..self
        }
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn max_poll_records(&self) -> usize {
        self.max_poll_records
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn auth_retry_policy(&self) -> &AuthRetryPolicy {
        &self.auth_retry_policy
    }

    pub fn missing_topics_fatal(&self) -> bool {
        self.missing_topics_fatal
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, Error> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| Error::invalid_config(name, format!("invalid value '{value}'")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Attempts;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::new(
            TopicName::try_new("project").unwrap(),
            ConsumerGroup::try_new("project-read-model").unwrap(),
        )
    }

    #[test]
    fn execute_config_validates_inputs() {
        match ExecuteConfig::default().with_max_retries(0) {
            Err(Error::InvalidConfig { message, parameter }) => {
                assert_eq!(message, "max_retries cannot be 0");
                assert_eq!(parameter, Some("max_retries".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }

        match ExecuteConfig::default().with_base_delay(0) {
            Err(Error::InvalidConfig { message, parameter }) => {
                assert_eq!(message, "base_retry_delay_ms cannot be 0");
                assert_eq!(parameter, Some("base_retry_delay_ms".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }

        let config = ExecuteConfig::default()
            .with_max_retries(5)
            .expect("Failed to set max_retries")
            .with_base_delay(200)
            .expect("Failed to set base_delay");

        assert_eq!(config.max_retries(), 5);
        assert_eq!(config.retry_delay().base_delay_ms(), 200);
    }

    #[test]
    fn topic_names_are_validated() {
        assert!(TopicName::try_new("csm.project-events_v2").is_ok());
        assert!(TopicName::try_new("").is_err());
        assert!(TopicName::try_new("has space").is_err());
        assert_eq!(TopicName::try_new(" project ").unwrap().as_ref(), "project");
    }

    #[test]
    fn consumer_defaults() {
        let config = config();
        assert_eq!(config.concurrency(), 1);
        assert_eq!(config.delivery_mode(), DeliveryMode::Transactional);
        assert_eq!(config.auth_retry_policy().interval(), Duration::from_secs(30));
        assert!(!config.missing_topics_fatal());
        assert!(config.clone().with_concurrency(0).is_err());
        assert!(config.clone().with_max_poll_records(0).is_err());
        assert!(config.with_poll_interval(Duration::ZERO).is_err());
    }

    #[test]
    fn reads_environment() {
        let config = ConsumerConfig::from_lookup(lookup(&[
            ("KLIO_TOPIC", "project"),
            ("KLIO_CONSUMER_GROUP", "activity"),
            ("KLIO_CONCURRENCY", "4"),
            ("KLIO_DELIVERY_MODE", "non-transactional"),
            ("KLIO_RETRY_INITIAL_DELAY_MS", "50"),
            ("KLIO_RETRY_MULTIPLIER", "1.5"),
            ("KLIO_RETRY_MAX_DELAY_MS", "500"),
            ("KLIO_RETRY_MAX_ATTEMPTS", "unbounded"),
            ("KLIO_AUTH_RETRY_INTERVAL_MS", "1000"),
            ("KLIO_MISSING_TOPICS_FATAL", "true"),
        ]))
        .unwrap();

        assert_eq!(config.topic().as_ref(), "project");
        assert_eq!(config.group().as_ref(), "activity");
        assert_eq!(config.concurrency(), 4);
        assert_eq!(config.delivery_mode(), DeliveryMode::NonTransactional);
        assert_eq!(config.retry_policy().attempts(), Attempts::Unbounded);
        assert_eq!(config.retry_policy().delay().base_delay_ms(), 50);
        assert_eq!(config.retry_policy().delay().multiplier(), 1.5);
        assert_eq!(config.retry_policy().delay().max_delay_ms(), 500);
        assert_eq!(config.auth_retry_policy().interval(), Duration::from_secs(1));
        assert!(config.missing_topics_fatal());
    }

    #[test]
    fn environment_errors_name_the_variable() {
        match ConsumerConfig::from_lookup(lookup(&[("KLIO_TOPIC", "project")])) {
            Err(Error::InvalidConfig { parameter, .. }) => {
                assert_eq!(parameter, Some("KLIO_CONSUMER_GROUP".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }

        match ConsumerConfig::from_lookup(lookup(&[
            ("KLIO_TOPIC", "project"),
            ("KLIO_CONSUMER_GROUP", "activity"),
            ("KLIO_CONCURRENCY", "many"),
        ])) {
            Err(Error::InvalidConfig { parameter, .. }) => {
                assert_eq!(parameter, Some("KLIO_CONCURRENCY".to_string()));
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }
    }
}
