use crate::ratelimit::RateLimit;
use crate::runtime::retry::RetryPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const DEFAULT_POLLING_INTERVAL_SECS: u64 = 10;
const DEFAULT_CHUNK_DELAY_SECS: u64 = 1;
const DEFAULT_FALL_BEHIND_THRESHOLD: u64 = 1_000;
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_WORKER_NAME: &str = "ProcessorDistributor";

/// What the detector does when the network runs further ahead of the
/// checkpoint than the fall-behind threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallBehindPolicy {
    /// Log a warning every cycle and keep broadcasting the backlog.
    #[default]
    Warn,
    /// Stop the detector with a fatal error.
    Halt,
}

/// Validated configuration for the epoch detector.
///
/// Instances must be constructed via [`DetectorConfig::builder`] so invariants are
/// validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    namespace: String,
    instance_id: String,
    authority_url: String,
    polling_interval: Duration,
    chunk_delay: Duration,
    fall_behind_threshold: u64,
    fall_behind_policy: FallBehindPolicy,
    source_timeout: Duration,
    checkpoint_retry: RetryPolicy,
}

impl DetectorConfig {
    pub fn builder() -> DetectorConfigBuilder {
        DetectorConfigBuilder::default()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Full URL of the epoch authority's current-epoch endpoint.
    pub fn authority_url(&self) -> &str {
        &self.authority_url
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Pause between consecutive chunk broadcasts while catching up.
    pub fn chunk_delay(&self) -> Duration {
        self.chunk_delay
    }

    pub fn fall_behind_threshold(&self) -> u64 {
        self.fall_behind_threshold
    }

    pub fn fall_behind_policy(&self) -> FallBehindPolicy {
        self.fall_behind_policy
    }

    pub fn source_timeout(&self) -> Duration {
        self.source_timeout
    }

    /// Retry policy applied to checkpoint writes.
    pub fn checkpoint_retry(&self) -> RetryPolicy {
        self.checkpoint_retry
    }

    fn validate(&self) -> Result<()> {
        validate_topic_word(&self.namespace, "namespace")?;
        validate_topic_word(&self.instance_id, "instance_id")?;
        validate_url(&self.authority_url, "authority_url")?;

        if self.polling_interval.is_zero() {
            bail!("polling_interval must be greater than 0");
        }

        if self.fall_behind_threshold == 0 {
            bail!("fall_behind_threshold must be greater than 0");
        }

        if self.source_timeout.is_zero() {
            bail!("source_timeout must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DetectorConfigBuilder {
    namespace: Option<String>,
    instance_id: Option<String>,
    authority_url: Option<String>,
    polling_interval: Option<Duration>,
    chunk_delay: Option<Duration>,
    fall_behind_threshold: Option<u64>,
    fall_behind_policy: Option<FallBehindPolicy>,
    source_timeout: Option<Duration>,
    checkpoint_retry: Option<RetryPolicy>,
}

impl DetectorConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn authority_url(mut self, url: impl Into<String>) -> Self {
        self.authority_url = Some(url.into());
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn fall_behind_threshold(mut self, blocks: u64) -> Self {
        self.fall_behind_threshold = Some(blocks);
        self
    }

    pub fn fall_behind_policy(mut self, policy: FallBehindPolicy) -> Self {
        self.fall_behind_policy = Some(policy);
        self
    }

    pub fn source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = Some(timeout);
        self
    }

    pub fn checkpoint_retry(mut self, policy: RetryPolicy) -> Self {
        self.checkpoint_retry = Some(policy);
        self
    }

    pub fn build(self) -> Result<DetectorConfig> {
        let config = DetectorConfig {
            namespace: trimmed(self.namespace.context("namespace is required")?),
            instance_id: trimmed(self.instance_id.context("instance_id is required")?),
            authority_url: trimmed(self.authority_url.context("authority_url is required")?),
            polling_interval: self
                .polling_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS)),
            chunk_delay: self
                .chunk_delay
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CHUNK_DELAY_SECS)),
            fall_behind_threshold: self
                .fall_behind_threshold
                .unwrap_or(DEFAULT_FALL_BEHIND_THRESHOLD),
            fall_behind_policy: self.fall_behind_policy.unwrap_or_default(),
            source_timeout: self
                .source_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS)),
            checkpoint_retry: self.checkpoint_retry.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// One project type and the contract addresses that make up its projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_type: String,
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFilter {
    #[serde(rename = "projectId")]
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "aggregate_on", rename_all = "snake_case")]
pub enum AggregationMode {
    /// Forward each finalized snapshot whose project id contains the filter.
    SingleProject { filters: ProjectFilter },
    /// Join finalized snapshots per epoch until every listed project reported.
    MultiProject { projects_to_wait_for: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub project_type: String,
    #[serde(flatten)]
    pub mode: AggregationMode,
}

impl AggregatorConfig {
    pub fn single_project(project_type: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            project_type: project_type.into(),
            mode: AggregationMode::SingleProject {
                filters: ProjectFilter {
                    project_id: filter.into(),
                },
            },
        }
    }

    pub fn multi_project<I, S>(project_type: impl Into<String>, projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            project_type: project_type.into(),
            mode: AggregationMode::MultiProject {
                projects_to_wait_for: projects.into_iter().map(Into::into).collect(),
            },
        }
    }

    fn validate(&self) -> Result<()> {
        validate_topic_word(&self.project_type, "aggregator project_type")?;
        match &self.mode {
            AggregationMode::SingleProject { filters } => {
                ensure_not_empty(
                    &filters.project_id,
                    &format!("aggregator {} filters.projectId", self.project_type),
                )?;
            }
            AggregationMode::MultiProject {
                projects_to_wait_for,
            } => {
                if projects_to_wait_for.is_empty() {
                    bail!(
                        "aggregator {} projects_to_wait_for cannot be empty",
                        self.project_type
                    );
                }
                let distinct: HashSet<&String> = projects_to_wait_for.iter().collect();
                if distinct.len() != projects_to_wait_for.len() {
                    bail!(
                        "aggregator {} projects_to_wait_for contains duplicates",
                        self.project_type
                    );
                }
            }
        }
        Ok(())
    }
}

/// Validated configuration for the processor distributor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributorConfig {
    namespace: String,
    instance_id: String,
    worker_name: String,
    chain_id: u64,
    web3_storage: bool,
    projects: Vec<ProjectConfig>,
    aggregators: Vec<AggregatorConfig>,
    requeue_backoff: RetryPolicy,
}

impl DistributorConfig {
    pub fn builder() -> DistributorConfigBuilder {
        DistributorConfigBuilder::default()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Name stamped into processing-log entries.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn web3_storage(&self) -> bool {
        self.web3_storage
    }

    pub fn projects(&self) -> &[ProjectConfig] {
        &self.projects
    }

    pub fn aggregators(&self) -> &[AggregatorConfig] {
        &self.aggregators
    }

    /// Backoff applied before requeueing a delivery that hit a store error.
    pub fn requeue_backoff(&self) -> RetryPolicy {
        self.requeue_backoff
    }

    fn validate(&self) -> Result<()> {
        validate_topic_word(&self.namespace, "namespace")?;
        validate_topic_word(&self.instance_id, "instance_id")?;
        ensure_not_empty(&self.worker_name, "worker_name")?;

        let mut seen_types = HashSet::new();
        for project in &self.projects {
            validate_topic_word(&project.project_type, "project_type")?;
            if !seen_types.insert(project.project_type.as_str()) {
                bail!("project_type {} is configured twice", project.project_type);
            }
            for contract in &project.projects {
                ensure_not_empty(contract, &format!("{} project address", project.project_type))?;
            }
        }

        let mut seen_aggregators = HashSet::new();
        for aggregator in &self.aggregators {
            aggregator.validate()?;
            if !seen_aggregators.insert(aggregator.project_type.as_str()) {
                bail!(
                    "aggregator project_type {} is configured twice",
                    aggregator.project_type
                );
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct DistributorConfigBuilder {
    namespace: Option<String>,
    instance_id: Option<String>,
    worker_name: Option<String>,
    chain_id: Option<u64>,
    web3_storage: Option<bool>,
    projects: Vec<ProjectConfig>,
    aggregators: Vec<AggregatorConfig>,
    requeue_backoff: Option<RetryPolicy>,
}

impl DistributorConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn web3_storage(mut self, enabled: bool) -> Self {
        self.web3_storage = Some(enabled);
        self
    }

    pub fn project<I, S>(mut self, project_type: impl Into<String>, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projects.push(ProjectConfig {
            project_type: project_type.into(),
            projects: contracts.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn projects(mut self, projects: Vec<ProjectConfig>) -> Self {
        self.projects = projects;
        self
    }

    pub fn aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregators.push(aggregator);
        self
    }

    pub fn aggregators(mut self, aggregators: Vec<AggregatorConfig>) -> Self {
        self.aggregators = aggregators;
        self
    }

    pub fn requeue_backoff(mut self, policy: RetryPolicy) -> Self {
        self.requeue_backoff = Some(policy);
        self
    }

    pub fn build(self) -> Result<DistributorConfig> {
        let config = DistributorConfig {
            namespace: trimmed(self.namespace.context("namespace is required")?),
            instance_id: trimmed(self.instance_id.context("instance_id is required")?),
            worker_name: self
                .worker_name
                .map(trimmed)
                .unwrap_or_else(|| DEFAULT_WORKER_NAME.to_owned()),
            chain_id: self.chain_id.context("chain_id is required")?,
            web3_storage: self.web3_storage.unwrap_or(true),
            projects: self.projects,
            aggregators: self.aggregators,
            requeue_backoff: self.requeue_backoff.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Deployment settings as loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub namespace: String,
    pub instance_id: String,
    pub chain_id: u64,
    pub redis_url: String,
    pub epoch_authority_url: String,
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
    #[serde(default = "default_chunk_delay_secs")]
    pub chunk_delay_secs: u64,
    #[serde(default = "default_fall_behind_threshold")]
    pub fall_behind_threshold: u64,
    #[serde(default)]
    pub fall_behind_policy: FallBehindPolicy,
    #[serde(default = "default_web3_storage")]
    pub web3_storage: bool,
    #[serde(default)]
    pub worker_name: Option<String>,
    /// Limit string for calls to the epoch authority, e.g. `"10/second;200/minute"`.
    #[serde(default)]
    pub rate_limit: Option<String>,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    #[serde(default)]
    pub aggregators: Vec<AggregatorConfig>,
}

impl Settings {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid settings json")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn detector_config(&self) -> Result<DetectorConfig> {
        DetectorConfig::builder()
            .namespace(&self.namespace)
            .instance_id(&self.instance_id)
            .authority_url(&self.epoch_authority_url)
            .polling_interval(Duration::from_secs(self.polling_interval_secs))
            .chunk_delay(Duration::from_secs(self.chunk_delay_secs))
            .fall_behind_threshold(self.fall_behind_threshold)
            .fall_behind_policy(self.fall_behind_policy)
            .build()
    }

    pub fn distributor_config(&self) -> Result<DistributorConfig> {
        let mut builder = DistributorConfig::builder()
            .namespace(&self.namespace)
            .instance_id(&self.instance_id)
            .chain_id(self.chain_id)
            .web3_storage(self.web3_storage)
            .projects(self.projects.clone())
            .aggregators(self.aggregators.clone());
        if let Some(name) = &self.worker_name {
            builder = builder.worker_name(name);
        }
        builder.build()
    }

    /// Parsed rate limits; empty when no limit is configured.
    pub fn rate_limits(&self) -> Result<Vec<RateLimit>> {
        match self.rate_limit.as_deref() {
            Some(spec) => RateLimit::parse_many(spec).context("invalid rate_limit"),
            None => Ok(Vec::new()),
        }
    }
}

fn default_polling_interval_secs() -> u64 {
    DEFAULT_POLLING_INTERVAL_SECS
}

fn default_chunk_delay_secs() -> u64 {
    DEFAULT_CHUNK_DELAY_SECS
}

fn default_fall_behind_threshold() -> u64 {
    DEFAULT_FALL_BEHIND_THRESHOLD
}

fn default_web3_storage() -> bool {
    true
}

fn trimmed(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

/// Routing keys split on `.` and match on whole words, so identifiers that
/// end up inside a key must not contain one.
fn validate_topic_word(value: &str, field: &str) -> Result<()> {
    ensure_not_empty(value, field)?;
    if value.contains(['.', '*', '#']) || value.chars().any(char::is_whitespace) {
        bail!("{field} must not contain '.', '*', '#' or whitespace");
    }
    Ok(())
}

fn validate_url(url: &str, field: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{field} must start with http:// or https://");
    }
    Ok(())
}
