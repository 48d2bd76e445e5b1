//! # Metric Report Engine - Tenant Usage Reporting Pipeline
//!
//! Retrieves metric series and synthetic monitor details from a tenant's REST
//! API and shapes them into entity-keyed tables for the reporting layer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          METRIC REPORT ENGINE                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  TRANSPORT → PAGE CURSOR FETCHER → SERIES MERGER    → HOST / DATAPOINT ROWS │
//! │                                  → MONITOR ENRICHER → ACTIVE / INACTIVE     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Cursor Following**: every paged query is drained until the API stops
//!   handing out continuation keys
//! - **Entity Join**: independently paged queries are joined per entity, with
//!   display names resolved from `:names` series
//! - **Monitor Enrichment**: bounded, order-preserving fan-out over monitor
//!   detail lookups with active/inactive partitioning
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime & Streams
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, info_span, trace, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Networking, Patterns, Identifiers
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client as HttpClient;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "metric-report";
pub const ENGINE_FULL_NAME: &str = "Tenant Metric Report Engine";

// ----------------------------------------------------------------------------
// API Surface
// ----------------------------------------------------------------------------

/// Metric series query endpoint (cursor paged)
pub const METRICS_QUERY_PATH: &str = "/api/v2/metrics/query";

/// Metric catalog endpoint (cursor paged)
pub const METRICS_CATALOG_PATH: &str = "/api/v2/metrics";

/// Synthetic monitor listing; details live under `{path}/{entityId}`
pub const SYNTHETIC_MONITORS_PATH: &str = "/api/v1/synthetic/monitors";

/// Query parameter carrying the continuation cursor on follow-up requests
pub const NEXT_PAGE_KEY_PARAM: &str = "nextPageKey";

/// Authorization scheme prefix for the API token header
pub const DEFAULT_AUTH_SCHEME: &str = "Api-Token";

// ----------------------------------------------------------------------------
// Query Defaults
// ----------------------------------------------------------------------------

/// Page size for metric series queries
pub const DEFAULT_QUERY_PAGE_SIZE: u32 = 300;

/// Page size for the metric catalog
pub const DEFAULT_CATALOG_PAGE_SIZE: u32 = 1000;

/// Largest page size accepted by configuration validation
pub const MAX_PAGE_SIZE: u32 = 10_000;

/// Default start of the query window
pub const DEFAULT_QUERY_FROM: &str = "now-2w";

/// Default series resolution
pub const DEFAULT_RESOLUTION: &str = "1d";

/// Resolutions the report accepts
pub const SUPPORTED_RESOLUTIONS: [&str; 5] = ["5m", "30m", "1h", "6h", "1d"];

pub const HOST_CPU_METRIC: &str = "builtin:host.cpu.usage";
pub const HOST_MEMORY_METRIC: &str = "builtin:host.mem.usage";
pub const HOST_DISK_METRIC: &str = "builtin:host.disk.usedPct";

/// Selectors behind the host utilization report. The first one doubles as the
/// hostname source, the last one returns the window averages.
pub const DEFAULT_HOST_SELECTORS: [&str; 4] = [
    "builtin:host.cpu.usage:names",
    "builtin:host.mem.usage",
    "builtin:host.disk.usedPct:merge(1)",
    "builtin:host.cpu.usage:fold,builtin:host.mem.usage:fold,builtin:host.disk.usedPct:fold:merge(1)",
];

// ----------------------------------------------------------------------------
// Decorations
// ----------------------------------------------------------------------------

/// Suffix marking a group whose series lead with the entity display name
pub const NAMES_DECORATION: &str = ":names";

// ----------------------------------------------------------------------------
// Synthetic Monitors
// ----------------------------------------------------------------------------

/// 365 * 24 * 60
pub const MINUTES_PER_YEAR: f64 = 525_600.0;

/// Step count used when a monitor detail carries no usable `events` list
pub const DEFAULT_STEP_COUNT: usize = 1;

/// Concurrent monitor detail requests
pub const DEFAULT_MONITOR_CONCURRENCY: usize = 8;

/// Upper bound for monitor detail concurrency
pub const MAX_MONITOR_CONCURRENCY: usize = 64;

/// Cost marker rendered for inactive monitors
pub const NOT_APPLICABLE: &str = "n/a";

// ----------------------------------------------------------------------------
// Transport & Environment
// ----------------------------------------------------------------------------

/// Default timeout for HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Maximum characters of a rejected response body kept in error messages
pub const MAX_ERROR_BODY_CHARS: usize = 200;

/// Prefix for environment overrides, `__` separates nested keys
pub const ENV_PREFIX: &str = "METRIC_REPORT_";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "metric-report.toml";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Wire types for the paged endpoints and the in-memory tables produced from
// them. Wire types mirror the API's camelCase payloads; table types are what
// the reporting layer consumes.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Series & Result Groups
// ----------------------------------------------------------------------------

/// Ordered samples of one series. `None` marks a gap.
pub type Samples = Vec<Option<f64>>;

/// One series inside a result group: positional dimensions plus samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// Epoch milliseconds, parallel to `values` when the API sends them
    #[serde(default)]
    pub timestamps: Vec<i64>,
    #[serde(default)]
    pub values: Samples,
}

/// All series returned for one metric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultGroup {
    pub metric_id: String,
    #[serde(default)]
    pub data: Vec<Series>,
}

// ----------------------------------------------------------------------------
// 3.2 Pages
// ----------------------------------------------------------------------------

/// One page of the metric series query endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPage {
    pub result: Vec<ResultGroup>,
    #[serde(default)]
    pub next_page_key: Option<String>,
}

/// One page of the metric catalog endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPage {
    pub metrics: Vec<CatalogEntry>,
    #[serde(default)]
    pub next_page_key: Option<String>,
}

/// A metric known to the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub metric_id: String,
    #[serde(default)]
    pub display_name: String,
}

// ----------------------------------------------------------------------------
// 3.3 Logical Results
// ----------------------------------------------------------------------------

/// Everything one paged query returned, in request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalResult<T = ResultGroup> {
    pub items: Vec<T>,
    /// Pages read to assemble `items`
    pub pages: usize,
}

impl<T> LogicalResult<T> {
    pub fn new(items: Vec<T>, pages: usize) -> Self {
        Self { items, pages }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

// ----------------------------------------------------------------------------
// 3.4 Metric Keys & Decorations
// ----------------------------------------------------------------------------

/// A server-side transformation appended to a metric key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decoration {
    /// `:names` - series carry the display name as their first dimension
    Names,
    /// `:fold` or `:fold(agg)` - the series is collapsed to one value
    Fold(Option<String>),
    /// `:merge(dim)` - a dimension was merged away
    Merge(String),
    /// `:avg`, `:max`, `:percentile(90)`, ...
    Aggregation(String),
}

/// Whether a key's samples are a full series or a folded summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Series,
    Folded,
}

/// Recognised trailing decorations. Arguments are matched one level deep, so
/// `:fold(avg)` is stripped but `:fold(value(avg))` stays part of the key.
static DECORATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r":(names|fold(?:\(([^()]*)\))?|merge\(([^()]*)\)|avg|min|max|sum|count|median|value|percentile\([^()]*\))$",
    )
    .expect("decoration pattern compiles")
});

/// A metric key split into its base metric and trailing decorations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricKey {
    raw: String,
    base: String,
    /// In source order
    decorations: Vec<Decoration>,
}

impl MetricKey {
    /// Peel recognised decorations off the end of `raw`.
    pub fn parse(raw: &str) -> Self {
        let mut base = raw;
        let mut decorations = Vec::new();

        while let Some(caps) = DECORATION_PATTERN.captures(base) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            // never strip the metric itself
            if whole.start() == 0 {
                break;
            }

            let name = name.as_str();
            let decoration = if name == "names" {
                Decoration::Names
            } else if name.starts_with("fold") {
                Decoration::Fold(caps.get(2).map(|m| m.as_str().to_string()))
            } else if name.starts_with("merge") {
                Decoration::Merge(caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default())
            } else {
                Decoration::Aggregation(name.to_string())
            };

            decorations.push(decoration);
            base = &base[..whole.start()];
        }

        decorations.reverse();
        Self {
            raw: raw.to_string(),
            base: base.to_string(),
            decorations,
        }
    }

    /// The key exactly as the API returned it.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Field name with every decoration removed.
    pub fn normalized(&self) -> &str {
        &self.base
    }

    pub fn decorations(&self) -> &[Decoration] {
        &self.decorations
    }

    /// True when the key ends in `:names`.
    pub fn is_names(&self) -> bool {
        self.raw.ends_with(NAMES_DECORATION)
    }

    /// The same key with a trailing `:names` removed.
    pub fn without_names(&self) -> MetricKey {
        match self.raw.strip_suffix(NAMES_DECORATION) {
            Some(stripped) => MetricKey::parse(stripped),
            None => self.clone(),
        }
    }

    pub fn shape(&self) -> Shape {
        if self
            .decorations
            .iter()
            .any(|d| matches!(d, Decoration::Fold(_)))
        {
            Shape::Folded
        } else {
            Shape::Series
        }
    }
}

impl Display for MetricKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Entity Records
// ----------------------------------------------------------------------------

/// Everything the merge learned about one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityRecord {
    pub display_name: Option<String>,
    /// Normalized field name to samples; the last group written wins
    pub metrics: BTreeMap<String, Samples>,
    /// Normalized field name to samples per shape, so a series and its fold
    /// can both be kept
    pub shapes: BTreeMap<String, BTreeMap<Shape, Samples>>,
}

impl EntityRecord {
    fn store(&mut self, key: &MetricKey, samples: &Samples) {
        let field = key.normalized();
        self.metrics.insert(field.to_string(), samples.clone());
        self.shapes
            .entry(field.to_string())
            .or_default()
            .insert(key.shape(), samples.clone());
    }

    pub fn metric(&self, field: &str) -> Option<&Samples> {
        self.metrics.get(field)
    }

    /// Full series stored for `field`.
    pub fn series(&self, field: &str) -> Option<&Samples> {
        self.shapes.get(field)?.get(&Shape::Series)
    }

    /// First non-gap value of the folded samples stored for `field`.
    pub fn folded(&self, field: &str) -> Option<f64> {
        self.shapes
            .get(field)?
            .get(&Shape::Folded)?
            .iter()
            .flatten()
            .copied()
            .next()
    }
}

/// Entity id to record, ordered by id.
pub type EntityTable = BTreeMap<String, EntityRecord>;

// ----------------------------------------------------------------------------
// 3.6 Monitor Records
// ----------------------------------------------------------------------------

/// Report classification of a synthetic monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MonitorType {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "Browser Clickpath")]
    BrowserClickpath,
    #[serde(rename = "Browser")]
    Browser,
}

impl MonitorType {
    /// HTTP by endpoint type, otherwise a browser monitor whose flavour
    /// depends on how many steps it replays.
    pub fn classify(endpoint_type: &str, steps: usize) -> Self {
        if endpoint_type == "HTTP" {
            MonitorType::Http
        } else if steps > 1 {
            MonitorType::BrowserClickpath
        } else {
            MonitorType::Browser
        }
    }
}

impl Display for MonitorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MonitorType::Http => write!(f, "HTTP"),
            MonitorType::BrowserClickpath => write!(f, "Browser Clickpath"),
            MonitorType::Browser => write!(f, "Browser"),
        }
    }
}

/// Cost column marker carried only by inactive monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CostMarker {
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl Display for CostMarker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", NOT_APPLICABLE)
    }
}

/// A synthetic monitor with its derived usage figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorRecord {
    pub entity_id: String,
    pub name: String,
    pub enabled: bool,
    pub frequency_minutes: u32,
    pub steps: usize,
    pub locations: usize,
    pub tags: Vec<String>,
    /// Tags joined with `", "`, empty when there are none
    pub tag_display: String,
    pub monitor_type: MonitorType,
    /// Deep link into the tenant UI
    pub link: String,
    pub actions_per_year: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostMarker>,
}

impl MonitorRecord {
    pub fn is_active(&self) -> bool {
        self.cost.is_none()
    }

    /// Yearly cost at `cost_per_action`. Inactive monitors have none.
    pub fn annual_cost(&self, cost_per_action: f64) -> Option<f64> {
        match self.cost {
            Some(CostMarker::NotApplicable) => None,
            None => Some(self.actions_per_year * cost_per_action),
        }
    }
}

/// `(minutes per year / frequency) * steps * locations`. A monitor without a
/// schedule (frequency 0) performs no scheduled actions.
pub fn actions_per_year(frequency_minutes: u32, steps: usize, locations: usize) -> f64 {
    if frequency_minutes == 0 {
        return 0.0;
    }
    (MINUTES_PER_YEAR / f64::from(frequency_minutes)) * steps as f64 * locations as f64
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Configuration problems abort the run. Transport and format problems abort
// the unit of work that hit them (one query, one monitor). Partial fields are
// recovered where they occur and never leave the pipeline.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Report Errors
// ----------------------------------------------------------------------------

/// The main error type for the report engine.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("No data returned for metric selector '{selector}'")]
    NoData { selector: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReportError {
    /// Whether the run can continue past this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReportError::Config(_) => false,
            ReportError::Transport(e) => e.is_recoverable(),
            ReportError::Format(_) => true,
            ReportError::NoData { .. } => true,
            ReportError::Io(_) => false,
            ReportError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ReportError::Config(_) => "config",
            ReportError::Transport(_) => "transport",
            ReportError::Format(_) => "format",
            ReportError::NoData { .. } => "no_data",
            ReportError::Io(_) => "io",
            ReportError::Internal(_) => "internal",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ReportError::Config(_) => RecoveryHint::FixConfiguration,
            ReportError::Transport(e) => e.recovery_hint(),
            ReportError::Format(_) | ReportError::NoData { .. } => RecoveryHint::Skip,
            ReportError::Io(_) | ReportError::Internal(_) => RecoveryHint::AlertOperator,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Skip this unit of work and continue
    Skip,
    /// Fix configuration and rerun
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Transport Errors
// ----------------------------------------------------------------------------

/// A request failed or was rejected.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to build HTTP client: {message}")]
    ClientBuild { message: String },

    #[error("Invalid request URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Request to '{url}' failed: {message}")]
    RequestFailed { url: String, message: String },

    #[error("Request to '{url}' timed out")]
    Timeout { url: String },

    #[error("Request to '{url}' rejected with HTTP {status}: {message}")]
    Rejected {
        url: String,
        status: u16,
        message: String,
    },
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            TransportError::ClientBuild { .. } | TransportError::InvalidUrl { .. }
        )
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            TransportError::ClientBuild { .. } | TransportError::InvalidUrl { .. } => {
                RecoveryHint::FixConfiguration
            }
            TransportError::Rejected { status: 401 | 403, .. } => RecoveryHint::FixConfiguration,
            _ => RecoveryHint::Skip,
        }
    }

    pub fn rejected(url: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        TransportError::Rejected {
            url: url.into(),
            status,
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Format Errors
// ----------------------------------------------------------------------------

/// A response body did not have the expected shape.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Malformed {context} body: {message}")]
    Body { context: String, message: String },

    #[error("Field '{field}' missing or invalid in {context}")]
    Field { context: String, field: String },
}

impl FormatError {
    pub fn body(context: impl Into<String>, error: serde_json::Error) -> Self {
        FormatError::Body {
            context: context.into(),
            message: error.to_string(),
        }
    }

    pub fn field(context: impl Into<String>, field: impl Into<String>) -> Self {
        FormatError::Field {
            context: context.into(),
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Partial Field Errors
// ----------------------------------------------------------------------------

/// An expected nested field is absent on one entity. Always recovered locally,
/// either with a default or by skipping the affected series or row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Field '{field}' absent in {context}")]
pub struct PartialFieldError {
    pub context: String,
    pub field: &'static str,
}

impl PartialFieldError {
    pub fn new(context: impl Into<String>, field: &'static str) -> Self {
        Self {
            context: context.into(),
            field,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for report operations
pub type ReportResult<T> = Result<T, ReportError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file merged with METRIC_REPORT_* environment overrides. Every field has
// a default so a bare environment is enough to run a report.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for a report run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Tenant endpoint and credentials
    #[serde(default)]
    pub tenant: TenantConfig,

    /// Metric query window and selectors
    #[serde(default)]
    pub query: QueryConfig,

    /// Synthetic monitor enrichment
    #[serde(default)]
    pub monitors: MonitorConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ReportConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Load from environment overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::new())
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges. Credentials are checked separately so that a
    /// config without them can still be validated and printed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.selectors.is_empty() {
            return Err(ConfigError::invalid_value(
                "query.selectors",
                "At least one metric selector is required",
            ));
        }

        for (field, size) in [
            ("query.page_size", self.query.page_size),
            ("query.catalog_page_size", self.query.catalog_page_size),
        ] {
            if size == 0 || size > MAX_PAGE_SIZE {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("Page size must be between 1 and {}", MAX_PAGE_SIZE),
                ));
            }
        }

        if !SUPPORTED_RESOLUTIONS.contains(&self.query.resolution.as_str()) {
            return Err(ConfigError::invalid_value(
                "query.resolution",
                format!(
                    "'{}' is not one of {}",
                    self.query.resolution,
                    SUPPORTED_RESOLUTIONS.join(", ")
                ),
            ));
        }

        if self.monitors.concurrency == 0 || self.monitors.concurrency > MAX_MONITOR_CONCURRENCY {
            return Err(ConfigError::invalid_value(
                "monitors.concurrency",
                format!("Concurrency must be between 1 and {}", MAX_MONITOR_CONCURRENCY),
            ));
        }

        if let Some(cost) = self.monitors.cost_per_action {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ConfigError::invalid_value(
                    "monitors.cost_per_action",
                    "Cost per action must be a non-negative number",
                ));
            }
        }

        if self.http.timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "http.timeout_secs",
                "Timeout must be at least 1 second",
            ));
        }

        Ok(())
    }

    /// Tenant URL and API token, or the first one that is missing.
    pub fn require_credentials(&self) -> Result<Credentials, ConfigError> {
        let url = self
            .tenant
            .url
            .as_deref()
            .map(normalize_tenant_url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::missing_field("tenant.url"))?;

        let api_token = self
            .tenant
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConfigError::missing_field("tenant.api_token"))?;

        Ok(Credentials {
            base_url: url,
            api_token: api_token.to_string(),
            auth_scheme: self.tenant.auth_scheme.clone(),
        })
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Strip whitespace and trailing slashes from a tenant URL.
pub fn normalize_tenant_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

// ----------------------------------------------------------------------------
// 5.2 Tenant Configuration
// ----------------------------------------------------------------------------

/// Tenant endpoint and API token
#[derive(Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Full tenant URL, e.g. `https://abc123.live.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// Authorization header scheme
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_token: None,
            auth_scheme: default_auth_scheme(),
        }
    }
}

impl Debug for TenantConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("url", &self.url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("auth_scheme", &self.auth_scheme)
            .finish()
    }
}

/// Validated tenant endpoint and token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Tenant URL without trailing slash
    pub base_url: String,
    pub api_token: String,
    pub auth_scheme: String,
}

impl Credentials {
    pub fn authorization(&self) -> String {
        format!("{} {}", self.auth_scheme, self.api_token)
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .field("auth_scheme", &self.auth_scheme)
            .finish()
    }
}

fn default_auth_scheme() -> String {
    DEFAULT_AUTH_SCHEME.into()
}

// ----------------------------------------------------------------------------
// 5.3 Query Configuration
// ----------------------------------------------------------------------------

/// Metric selectors and query window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Selectors run by the host utilization report
    #[serde(default = "default_selectors")]
    pub selectors: Vec<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_catalog_page_size")]
    pub catalog_page_size: u32,

    /// Window start, absolute or relative (`now-2w`)
    #[serde(default = "default_from")]
    pub from: String,

    /// Window end; the API defaults to now
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default = "default_resolution")]
    pub resolution: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            selectors: default_selectors(),
            page_size: default_page_size(),
            catalog_page_size: default_catalog_page_size(),
            from: default_from(),
            to: None,
            resolution: default_resolution(),
        }
    }
}

impl QueryConfig {
    /// First-page request for one selector.
    pub fn series_request(&self, selector: &str) -> ApiRequest {
        ApiRequest::new(METRICS_QUERY_PATH)
            .param("metricSelector", selector)
            .param("pageSize", self.page_size.to_string())
            .param("from", self.from.as_str())
            .param_opt("to", self.to.as_deref())
            .param("resolution", self.resolution.as_str())
    }

    pub fn catalog_request(&self) -> ApiRequest {
        ApiRequest::new(METRICS_CATALOG_PATH).param("pageSize", self.catalog_page_size.to_string())
    }
}

fn default_selectors() -> Vec<String> {
    DEFAULT_HOST_SELECTORS.iter().map(|s| s.to_string()).collect()
}

fn default_page_size() -> u32 {
    DEFAULT_QUERY_PAGE_SIZE
}

fn default_catalog_page_size() -> u32 {
    DEFAULT_CATALOG_PAGE_SIZE
}

fn default_from() -> String {
    DEFAULT_QUERY_FROM.into()
}

fn default_resolution() -> String {
    DEFAULT_RESOLUTION.into()
}

// ----------------------------------------------------------------------------
// 5.4 Monitor & HTTP Configuration
// ----------------------------------------------------------------------------

/// Synthetic monitor enrichment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Concurrent detail requests
    #[serde(default = "default_monitor_concurrency")]
    pub concurrency: usize,

    /// Price of one synthetic action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_action: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_monitor_concurrency(),
            cost_per_action: None,
        }
    }
}

fn default_monitor_concurrency() -> usize {
    DEFAULT_MONITOR_CONCURRENCY
}

/// HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_user_agent() -> String {
    format!("{}/{}", ENGINE_NAME, ENGINE_VERSION)
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Logs go to stderr; stdout is reserved for report output.
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ReportResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_current_span(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ReportError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ReportError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ReportError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    debug!(
        target: "metric_report::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: TRANSPORT
// ============================================================================
// The only place that talks HTTP. Everything above it sees `ApiRequest` in and
// body text out, which keeps the cursor loop and the enrichment testable
// without a server.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Requests
// ----------------------------------------------------------------------------

/// A GET against the tenant API: path plus ordered query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn param_opt(self, key: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    /// Follow-up request for the next page: same path, only the cursor.
    pub fn continuation(&self, cursor: &str) -> Self {
        Self::new(self.path.clone()).param(NEXT_PAGE_KEY_PARAM, cursor)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn cursor(&self) -> Option<&str> {
        self.get(NEXT_PAGE_KEY_PARAM)
    }
}

impl Display for ApiRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        for (i, (key, value)) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, key, value)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 7.2 Transport Trait
// ----------------------------------------------------------------------------

/// Executes API requests and returns the raw body of a successful response.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &ApiRequest) -> TransportResult<String>;
}

// ----------------------------------------------------------------------------
// 7.3 HTTP Transport
// ----------------------------------------------------------------------------

/// `reqwest`-backed transport bound to one tenant.
#[derive(Clone)]
pub struct HttpTransport {
    client: HttpClient,
    base_url: String,
    authorization: String,
}

impl HttpTransport {
    pub fn new(credentials: &Credentials, config: &HttpConfig) -> TransportResult<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| TransportError::ClientBuild {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: credentials.base_url.clone(),
            authorization: credentials.authorization(),
        })
    }

    fn url_for(&self, request: &ApiRequest) -> TransportResult<reqwest::Url> {
        let raw = format!("{}{}", self.base_url, request.path);
        let mut url = reqwest::Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
            url: raw.clone(),
            message: e.to_string(),
        })?;

        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }
}

impl Debug for HttpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &ApiRequest) -> TransportResult<String> {
        let url = self.url_for(request)?;
        let start = Instant::now();

        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    TransportError::RequestFailed {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::RequestFailed {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        trace!(
            target: "metric_report::transport",
            path = %request.path,
            status = status.as_u16(),
            bytes = body.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Response received"
        );

        if !status.is_success() {
            return Err(TransportError::rejected(
                url.to_string(),
                status.as_u16(),
                api_error_message(&body),
            ));
        }

        Ok(body)
    }
}

/// `error.message` from an API error body, else the start of the body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_CHARS).collect())
}

// ============================================================================
// SECTION 8: PAGE CURSOR FETCHER
// ============================================================================
// One logical query = first request + one follow-up per continuation cursor.
// The loop has no iteration cap: it ends exactly when a page comes back
// without a cursor.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Page Shapes
// ----------------------------------------------------------------------------

/// A page payload that yields items and maybe a continuation cursor.
pub trait Paged: DeserializeOwned {
    type Item;

    /// Used in logs and format errors
    const KIND: &'static str;

    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Paged for MetricsPage {
    type Item = ResultGroup;
    const KIND: &'static str = "metrics query page";

    fn into_parts(self) -> (Vec<ResultGroup>, Option<String>) {
        (self.result, self.next_page_key)
    }
}

impl Paged for CatalogPage {
    type Item = CatalogEntry;
    const KIND: &'static str = "metrics catalog page";

    fn into_parts(self) -> (Vec<CatalogEntry>, Option<String>) {
        (self.metrics, self.next_page_key)
    }
}

// ----------------------------------------------------------------------------
// 8.2 Fetcher
// ----------------------------------------------------------------------------

/// Drains cursor-paged endpoints into a single `LogicalResult`.
#[derive(Clone)]
pub struct PageCursorFetcher {
    transport: Arc<dyn Transport>,
}

impl PageCursorFetcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Run `initial` and every follow-up page it leads to.
    pub async fn fetch<P: Paged>(&self, initial: &ApiRequest) -> ReportResult<LogicalResult<P::Item>> {
        let start = Instant::now();
        let mut items = Vec::new();
        let mut pages = 0usize;
        let mut request = initial.clone();

        loop {
            let body = self.transport.get(&request).await?;
            let page: P = serde_json::from_str(&body).map_err(|e| FormatError::body(P::KIND, e))?;
            pages += 1;

            let (page_items, cursor) = page.into_parts();
            let cursor = cursor.filter(|c| !c.is_empty());

            debug!(
                target: "metric_report::fetch",
                kind = P::KIND,
                page = pages,
                items = page_items.len(),
                more = cursor.is_some(),
                "Page received"
            );

            items.extend(page_items);

            match cursor {
                Some(cursor) => request = initial.continuation(&cursor),
                None => break,
            }
        }

        debug!(
            target: "metric_report::fetch",
            kind = P::KIND,
            path = %initial.path,
            pages,
            items = items.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Paged query complete"
        );

        Ok(LogicalResult::new(items, pages))
    }

    /// All result groups for one metric selector.
    pub async fn fetch_series(&self, selector: &str, query: &QueryConfig) -> ReportResult<LogicalResult> {
        self.fetch::<MetricsPage>(&query.series_request(selector)).await
    }

    /// The whole metric catalog.
    pub async fn fetch_catalog(&self, query: &QueryConfig) -> ReportResult<LogicalResult<CatalogEntry>> {
        self.fetch::<CatalogPage>(&query.catalog_request()).await
    }
}

impl Debug for PageCursorFetcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCursorFetcher").finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 9: DIMENSIONAL SERIES MERGER
// ============================================================================
// Joins independently paged metric queries into one record per entity.
//
// Phase 1 reads every `:names` group across all inputs and records display
// names. Phase 2 then stores samples for every group, the names groups
// included under their stripped key. Because phase 1 finishes before phase 2
// starts, the order of the inputs never changes which names are resolved.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Group Classification
// ----------------------------------------------------------------------------

/// How the dimensions of a group's series are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    /// `(displayName, entityKey, ...)`
    Names,
    /// `(entityKey, ...)`
    Metric,
}

/// A result group with its key parsed once.
#[derive(Debug)]
struct NormalizedGroup<'a> {
    source: &'a ResultGroup,
    kind: GroupKind,
    /// Key the samples are stored under (`:names` removed)
    key: MetricKey,
}

impl<'a> NormalizedGroup<'a> {
    fn new(source: &'a ResultGroup) -> Self {
        let parsed = MetricKey::parse(&source.metric_id);
        if parsed.is_names() {
            Self {
                source,
                kind: GroupKind::Names,
                key: parsed.without_names(),
            }
        } else {
            Self {
                source,
                kind: GroupKind::Metric,
                key: parsed,
            }
        }
    }
}

/// One series viewed through its group's dimension convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsedSeries<'a> {
    Name {
        name: &'a str,
        entity_key: &'a str,
        rest: &'a [String],
    },
    Metric {
        entity_key: &'a str,
        rest: &'a [String],
    },
}

impl<'a> ParsedSeries<'a> {
    fn parse(kind: GroupKind, series: &'a Series, context: &str) -> Result<Self, PartialFieldError> {
        match (kind, series.dimensions.as_slice()) {
            (GroupKind::Names, [name, entity_key, rest @ ..]) => Ok(ParsedSeries::Name {
                name,
                entity_key,
                rest,
            }),
            (GroupKind::Names, _) => Err(PartialFieldError::new(context, "dimensions[1]")),
            (GroupKind::Metric, [entity_key, rest @ ..]) => Ok(ParsedSeries::Metric { entity_key, rest }),
            (GroupKind::Metric, []) => Err(PartialFieldError::new(context, "dimensions[0]")),
        }
    }

    fn entity_key(&self) -> &'a str {
        match self {
            ParsedSeries::Name { entity_key, .. } | ParsedSeries::Metric { entity_key, .. } => entity_key,
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Merger
// ----------------------------------------------------------------------------

/// Builds an [`EntityTable`] from any number of logical results.
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionalSeriesMerger;

impl DimensionalSeriesMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merge `results` into a fresh table. The input is not modified.
    pub fn merge(&self, results: &[LogicalResult]) -> EntityTable {
        let groups: Vec<NormalizedGroup<'_>> = results
            .iter()
            .flat_map(|r| r.items.iter())
            .map(NormalizedGroup::new)
            .collect();

        let mut table = EntityTable::new();

        // phase 1: display names
        for group in groups.iter().filter(|g| g.kind == GroupKind::Names) {
            for series in &group.source.data {
                match ParsedSeries::parse(group.kind, series, &group.source.metric_id) {
                    Ok(ParsedSeries::Name { name, entity_key, .. }) => {
                        table.entry(entity_key.to_string()).or_default().display_name = Some(name.to_string());
                    }
                    Ok(ParsedSeries::Metric { .. }) => {}
                    Err(e) => {
                        warn!(
                            target: "metric_report::merge",
                            metric = %group.source.metric_id,
                            dimensions = series.dimensions.len(),
                            error = %e,
                            "Skipping names series without entity key"
                        );
                    }
                }
            }
        }

        // phase 2: samples
        let mut stored = 0usize;
        for group in &groups {
            for series in &group.source.data {
                let parsed = match ParsedSeries::parse(group.kind, series, &group.source.metric_id) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        // names series were already reported in phase 1
                        if group.kind == GroupKind::Metric {
                            warn!(
                                target: "metric_report::merge",
                                metric = %group.source.metric_id,
                                error = %e,
                                "Skipping series without dimensions"
                            );
                        }
                        continue;
                    }
                };

                table
                    .entry(parsed.entity_key().to_string())
                    .or_default()
                    .store(&group.key, &series.values);
                stored += 1;
            }
        }

        debug!(
            target: "metric_report::merge",
            groups = groups.len(),
            series = stored,
            entities = table.len(),
            "Merge complete"
        );

        table
    }
}

// ============================================================================
// SECTION 10: ENTITY ENRICHMENT
// ============================================================================
// Expands the synthetic monitor listing into detail records. Detail requests
// fan out with bounded concurrency; results are collected in listing order.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Wire Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct MonitorListing {
    monitors: Vec<MonitorRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorRef {
    entity_id: String,
}

/// Detail payload of one synthetic monitor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorDetail {
    #[serde(default)]
    entity_id: Option<String>,
    name: String,
    enabled: bool,
    frequency_min: u32,
    #[serde(default)]
    tags: Option<Vec<MonitorTag>>,
    #[serde(default)]
    events: Option<JsonValue>,
    locations: JsonValue,
    #[serde(rename = "type")]
    monitor_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MonitorTag {
    key: String,
}

impl MonitorDetail {
    /// Keys of the `tags` list.
    fn tag_keys(&self, context: &str) -> Result<Vec<String>, PartialFieldError> {
        self.tags
            .as_ref()
            .map(|tags| tags.iter().map(|t| t.key.clone()).collect())
            .ok_or_else(|| PartialFieldError::new(context, "tags"))
    }

    /// Length of the `events` array.
    fn step_count(&self, context: &str) -> Result<usize, PartialFieldError> {
        self.events
            .as_ref()
            .and_then(JsonValue::as_array)
            .map(Vec::len)
            .ok_or_else(|| PartialFieldError::new(context, "events"))
    }

    /// Length of the `locations` array, or the value itself when it is a count.
    fn location_count(&self, context: &str) -> Result<usize, FormatError> {
        match &self.locations {
            JsonValue::Array(items) => Ok(items.len()),
            JsonValue::Number(n) => n
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| FormatError::field(context, "locations")),
            _ => Err(FormatError::field(context, "locations")),
        }
    }
}

// ----------------------------------------------------------------------------
// 10.2 Enrichment Results
// ----------------------------------------------------------------------------

/// A monitor whose detail could not be fetched or parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMonitor {
    pub entity_id: String,
    pub error: String,
}

/// Monitors partitioned by enabled flag, each side in listing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Enrichment {
    pub active: Vec<MonitorRecord>,
    pub inactive: Vec<MonitorRecord>,
    pub skipped: Vec<SkippedMonitor>,
}

impl Enrichment {
    /// Every identifier handled, whichever side it landed on.
    pub fn total(&self) -> usize {
        self.active.len() + self.inactive.len() + self.skipped.len()
    }

    pub fn total_active_actions(&self) -> f64 {
        self.active.iter().map(|m| m.actions_per_year).sum()
    }
}

// ----------------------------------------------------------------------------
// 10.3 Enricher
// ----------------------------------------------------------------------------

/// Fetches and derives synthetic monitor records.
#[derive(Clone)]
pub struct EntityEnrichment {
    transport: Arc<dyn Transport>,
    tenant_url: String,
    concurrency: usize,
}

impl EntityEnrichment {
    pub fn new(transport: Arc<dyn Transport>, tenant_url: impl Into<String>, concurrency: usize) -> Self {
        Self {
            transport,
            tenant_url: normalize_tenant_url(&tenant_url.into()),
            concurrency: concurrency.max(1),
        }
    }

    /// Entity ids of every synthetic monitor, in listing order.
    pub async fn fetch_listing(&self) -> ReportResult<Vec<String>> {
        let body = self.transport.get(&ApiRequest::new(SYNTHETIC_MONITORS_PATH)).await?;
        let listing: MonitorListing =
            serde_json::from_str(&body).map_err(|e| FormatError::body("synthetic monitor listing", e))?;

        Ok(listing.monitors.into_iter().map(|m| m.entity_id).collect())
    }

    /// Fetch the listing, then enrich it. A failed listing fails the whole call.
    pub async fn enrich_listing(&self) -> ReportResult<Enrichment> {
        let listing = self.fetch_listing().await?;
        info!(
            target: "metric_report::enrich",
            monitors = listing.len(),
            "Monitor listing fetched"
        );
        Ok(self.enrich(&listing).await)
    }

    /// Fetch details for every id. Failures skip only the id they belong to.
    pub async fn enrich(&self, listing: &[String]) -> Enrichment {
        let start = Instant::now();

        let outcomes: Vec<(&String, ReportResult<MonitorRecord>)> = stream::iter(listing)
            .map(|entity_id| async move { (entity_id, self.fetch_record(entity_id).await) })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut enrichment = Enrichment::default();
        for (entity_id, outcome) in outcomes {
            match outcome {
                Ok(record) if record.enabled => enrichment.active.push(record),
                Ok(record) => enrichment.inactive.push(record),
                Err(e) => {
                    warn!(
                        target: "metric_report::enrich",
                        entity_id = %entity_id,
                        category = e.category(),
                        error = %e,
                        "Skipping monitor"
                    );
                    enrichment.skipped.push(SkippedMonitor {
                        entity_id: entity_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            target: "metric_report::enrich",
            active = enrichment.active.len(),
            inactive = enrichment.inactive.len(),
            skipped = enrichment.skipped.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Enrichment complete"
        );

        enrichment
    }

    async fn fetch_record(&self, entity_id: &str) -> ReportResult<MonitorRecord> {
        let request = ApiRequest::new(format!("{}/{}", SYNTHETIC_MONITORS_PATH, entity_id));
        let body = self.transport.get(&request).await?;
        let context = format!("monitor {}", entity_id);
        let detail: MonitorDetail = serde_json::from_str(&body).map_err(|e| FormatError::body(context.as_str(), e))?;

        self.build_record(entity_id, detail, &context)
    }

    fn build_record(&self, entity_id: &str, detail: MonitorDetail, context: &str) -> ReportResult<MonitorRecord> {
        let steps = detail.step_count(context).unwrap_or_else(|e| {
            debug!(
                target: "metric_report::enrich",
                entity_id = %entity_id,
                error = %e,
                default = DEFAULT_STEP_COUNT,
                "Using default step count"
            );
            DEFAULT_STEP_COUNT
        });
        let locations = detail.location_count(context)?;
        let monitor_type = MonitorType::classify(&detail.monitor_type, steps);

        let tags = detail.tag_keys(context).unwrap_or_else(|e| {
            debug!(
                target: "metric_report::enrich",
                entity_id = %entity_id,
                error = %e,
                "Monitor has no tags"
            );
            Vec::new()
        });

        let entity_id = detail.entity_id.unwrap_or_else(|| entity_id.to_string());
        let link = monitor_link(&self.tenant_url, monitor_type, &entity_id);

        Ok(MonitorRecord {
            tag_display: tags.join(", "),
            tags,
            name: detail.name,
            enabled: detail.enabled,
            frequency_minutes: detail.frequency_min,
            steps,
            locations,
            monitor_type,
            link,
            actions_per_year: actions_per_year(detail.frequency_min, steps, locations),
            cost: (!detail.enabled).then_some(CostMarker::NotApplicable),
            entity_id,
        })
    }
}

impl Debug for EntityEnrichment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEnrichment")
            .field("tenant_url", &self.tenant_url)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Tenant UI deep link for a monitor.
pub fn monitor_link(tenant_url: &str, monitor_type: MonitorType, entity_id: &str) -> String {
    match monitor_type {
        MonitorType::Http => format!("{}/#httpcheckdetails;id={}", tenant_url, entity_id),
        _ => format!("{}/#monitordetailkpm;webcheckId={}", tenant_url, entity_id),
    }
}

// ============================================================================
// SECTION 11: REPORT RUNNERS
// ============================================================================
// Wires fetcher, merger and enricher into the four report flows.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Host Utilization Rows
// ----------------------------------------------------------------------------

/// One host line of the utilization report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostUtilizationRow {
    pub entity_id: String,
    pub link: String,
    pub hostname: Option<String>,
    /// Window averages as fractions, e.g. `0.4213` for 42.13 %
    pub cpu_avg: f64,
    pub memory_avg: f64,
    pub disk_avg: f64,
    pub cpu_series: Samples,
    pub memory_series: Samples,
    pub disk_series: Samples,
}

impl HostUtilizationRow {
    pub fn from_record(tenant_url: &str, entity_id: &str, record: &EntityRecord) -> Result<Self, PartialFieldError> {
        let context = format!("host {}", entity_id);
        let series = |field: &'static str| {
            record
                .series(field)
                .cloned()
                .ok_or_else(|| PartialFieldError::new(context.as_str(), field))
        };
        let folded = |field: &'static str| {
            record
                .folded(field)
                .map(percent_to_fraction)
                .ok_or_else(|| PartialFieldError::new(context.as_str(), field))
        };

        Ok(Self {
            entity_id: entity_id.to_string(),
            link: host_link(tenant_url, entity_id),
            hostname: record.display_name.clone(),
            cpu_avg: folded(HOST_CPU_METRIC)?,
            memory_avg: folded(HOST_MEMORY_METRIC)?,
            disk_avg: folded(HOST_DISK_METRIC)?,
            cpu_series: series(HOST_CPU_METRIC)?,
            memory_series: series(HOST_MEMORY_METRIC)?,
            disk_series: series(HOST_DISK_METRIC)?,
        })
    }
}

/// Percent rounded to two decimals, expressed as a fraction.
fn percent_to_fraction(percent: f64) -> f64 {
    (percent * 100.0).round() / 100.0 / 100.0
}

pub fn host_link(tenant_url: &str, entity_id: &str) -> String {
    format!("{}/#newhosts/hostdetails;id={}", tenant_url, entity_id)
}

/// A selector that failed while its siblings were still merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedQuery {
    pub selector: String,
    pub error: String,
}

/// Output of the host utilization flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostReport {
    pub rows: Vec<HostUtilizationRow>,
    /// Hosts dropped for missing a required field
    pub incomplete_hosts: usize,
    pub failed_queries: Vec<FailedQuery>,
}

// ----------------------------------------------------------------------------
// 11.2 Datapoint Tables
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatapointRow {
    /// Dimensions joined with `" / "`
    pub label: String,
    pub values: Samples,
}

/// Samples of one selector laid out as a grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatapointTable {
    pub selector: String,
    /// Formatted timestamps of the first series
    pub headers: Vec<String>,
    pub rows: Vec<DatapointRow>,
}

impl DatapointTable {
    /// Only the first result group is laid out; the rows of a comma-separated
    /// selector's later metrics would carry indistinguishable labels.
    pub fn from_result(selector: &str, result: &LogicalResult) -> ReportResult<Self> {
        let no_data = || ReportError::NoData {
            selector: selector.to_string(),
        };
        let group = result.items.first().ok_or_else(no_data)?;
        let first = group.data.first().ok_or_else(no_data)?;

        if result.items.len() > 1 {
            debug!(
                target: "metric_report::datapoints",
                selector = %selector,
                metric = %group.metric_id,
                ignored_groups = result.items.len() - 1,
                "Using first result group only"
            );
        }

        Ok(Self {
            selector: selector.to_string(),
            headers: first.timestamps.iter().map(|ts| format_timestamp(*ts)).collect(),
            rows: group
                .data
                .iter()
                .map(|s| DatapointRow {
                    label: s.dimensions.join(" / "),
                    values: s.values.clone(),
                })
                .collect(),
        })
    }
}

/// `MM/DD/YYYY HH:MM` in UTC. Out-of-range values render as the raw number.
pub fn format_timestamp(epoch_ms: i64) -> String {
    let secs = epoch_ms.div_euclid(1000);
    let nanos = (epoch_ms.rem_euclid(1000) * 1_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|dt| dt.format("%m/%d/%Y %H:%M").to_string())
        .unwrap_or_else(|| epoch_ms.to_string())
}

// ----------------------------------------------------------------------------
// 11.3 Synthetic Report
// ----------------------------------------------------------------------------

/// Enrichment plus yearly totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyntheticReport {
    #[serde(flatten)]
    pub enrichment: Enrichment,
    pub total_active_actions: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_action: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_annual_cost: Option<f64>,
}

impl SyntheticReport {
    pub fn new(enrichment: Enrichment, cost_per_action: Option<f64>) -> Self {
        let total_active_actions = enrichment.total_active_actions();
        let total_annual_cost = cost_per_action.map(|cost| {
            enrichment
                .active
                .iter()
                .filter_map(|m| m.annual_cost(cost))
                .sum()
        });

        Self {
            enrichment,
            total_active_actions,
            cost_per_action,
            total_annual_cost,
        }
    }
}

// ----------------------------------------------------------------------------
// 11.4 Runner
// ----------------------------------------------------------------------------

/// Runs report flows against one tenant.
#[derive(Clone)]
pub struct ReportRunner {
    config: ReportConfig,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
}

impl ReportRunner {
    /// Validate `config` and build an HTTP transport for its tenant.
    pub fn new(config: ReportConfig) -> ReportResult<Self> {
        config.validate()?;
        let credentials = config.require_credentials()?;
        let transport = HttpTransport::new(&credentials, &config.http)?;

        Ok(Self {
            config,
            credentials,
            transport: Arc::new(transport),
        })
    }

    /// Same as [`ReportRunner::new`] with a caller-supplied transport.
    pub fn with_transport(config: ReportConfig, transport: Arc<dyn Transport>) -> ReportResult<Self> {
        config.validate()?;
        let credentials = config.require_credentials()?;

        Ok(Self {
            config,
            credentials,
            transport,
        })
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    fn fetcher(&self) -> PageCursorFetcher {
        PageCursorFetcher::new(Arc::clone(&self.transport))
    }

    /// Run every configured selector, merge what succeeded and derive rows.
    pub async fn host_utilization(&self) -> ReportResult<HostReport> {
        let fetcher = self.fetcher();
        let mut results = Vec::with_capacity(self.config.query.selectors.len());
        let mut failed_queries = Vec::new();
        let mut first_error = None;

        for selector in &self.config.query.selectors {
            match fetcher.fetch_series(selector, &self.config.query).await {
                Ok(result) => {
                    info!(
                        target: "metric_report::hosts",
                        selector = %selector,
                        groups = result.len(),
                        pages = result.pages,
                        "Selector fetched"
                    );
                    results.push(result);
                }
                Err(e) => {
                    warn!(
                        target: "metric_report::hosts",
                        selector = %selector,
                        error = %e,
                        "Selector failed"
                    );
                    failed_queries.push(FailedQuery {
                        selector: selector.clone(),
                        error: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }

        if results.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let table = DimensionalSeriesMerger::new().merge(&results);
        let mut rows = Vec::with_capacity(table.len());
        let mut incomplete_hosts = 0;

        for (entity_id, record) in &table {
            match HostUtilizationRow::from_record(&self.credentials.base_url, entity_id, record) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    incomplete_hosts += 1;
                    debug!(
                        target: "metric_report::hosts",
                        error = %e,
                        "Skipping incomplete host"
                    );
                }
            }
        }

        info!(
            target: "metric_report::hosts",
            hosts = rows.len(),
            incomplete = incomplete_hosts,
            failed_selectors = failed_queries.len(),
            "Host utilization report built"
        );

        Ok(HostReport {
            rows,
            incomplete_hosts,
            failed_queries,
        })
    }

    /// Every metric in the tenant catalog.
    pub async fn metric_catalog(&self) -> ReportResult<Vec<CatalogEntry>> {
        let result = self.fetcher().fetch_catalog(&self.config.query).await?;
        info!(
            target: "metric_report::catalog",
            metrics = result.len(),
            pages = result.pages,
            "Metric catalog fetched"
        );
        Ok(result.into_items())
    }

    /// Samples of one selector as a timestamp-headed grid.
    pub async fn datapoints(&self, selector: &str) -> ReportResult<DatapointTable> {
        let result = self.fetcher().fetch_series(selector, &self.config.query).await?;
        let table = DatapointTable::from_result(selector, &result)?;
        info!(
            target: "metric_report::datapoints",
            selector = %selector,
            rows = table.rows.len(),
            columns = table.headers.len(),
            "Datapoint table built"
        );
        Ok(table)
    }

    /// Enrich the full synthetic monitor listing.
    pub async fn synthetic_usage(&self) -> ReportResult<SyntheticReport> {
        let enrichment = EntityEnrichment::new(
            Arc::clone(&self.transport),
            self.credentials.base_url.as_str(),
            self.config.monitors.concurrency,
        )
        .enrich_listing()
        .await?;

        Ok(SyntheticReport::new(enrichment, self.config.monitors.cost_per_action))
    }
}

impl Debug for ReportRunner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportRunner")
            .field("credentials", &self.credentials)
            .field("selectors", &self.config.query.selectors)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 12: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Metric Report CLI
#[derive(Parser, Debug)]
#[command(
    name = "metric-report",
    author = "AIOps Team",
    version,
    about = "Tenant metric and synthetic monitor usage reports",
    long_about = "Pulls paged metric series and synthetic monitor details from a tenant API, \
                  joins them per entity and prints the resulting report tables as JSON."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "METRIC_REPORT_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "METRIC_REPORT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "METRIC_REPORT_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Host CPU, memory and disk utilization (default)
    Hosts,

    /// List the tenant's metric catalog
    Catalog,

    /// Datapoints of a single metric selector
    Datapoints {
        /// Metric selector, e.g. builtin:host.cpu.usage
        #[arg(short, long)]
        metric: String,

        /// Window start override
        #[arg(long)]
        from: Option<String>,

        /// Window end override
        #[arg(long)]
        to: Option<String>,

        /// Resolution override
        #[arg(short, long)]
        resolution: Option<String>,
    },

    /// Synthetic monitor usage and yearly actions
    Synthetic,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 12.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> ReportResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ReportConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Tenant: {}", config.tenant.url.as_deref().unwrap_or("<not set>"));
            println!(
                "  • API token: {}",
                if config.tenant.api_token.is_some() { "set" } else { "<not set>" }
            );
            println!("  • Selectors: {}", config.query.selectors.len());
            println!("  • Window: {} .. {}", config.query.from, config.query.to.as_deref().unwrap_or("now"));
            println!("  • Resolution: {}", config.query.resolution);
            println!("  • Monitor concurrency: {}", config.monitors.concurrency);

            if let Err(e) = config.require_credentials() {
                println!("⚠️  {}", e);
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ReportError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> ReportResult<()> {
    let config_str = ReportConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Reports:");
    println!("  • Host utilization");
    println!("  • Metric catalog");
    println!("  • Metric datapoints");
    println!("  • Synthetic monitor usage");
}

fn print_json<T: Serialize>(value: &T) -> AnyhowResult<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize report")?);
    Ok(())
}

// ============================================================================
// SECTION 13: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the report CLI
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need a tenant
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = if cli.config.exists() {
        ReportConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ReportConfig::from_env().context("Failed to load config from environment")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;

    if !cli.config.exists() {
        debug!(
            target: "metric_report::init",
            path = %cli.config.display(),
            "Config file not found, using defaults and environment"
        );
    }

    if let Some(Commands::Datapoints { from, to, resolution, .. }) = &cli.command {
        if let Some(from) = from {
            config.query.from = from.clone();
        }
        if to.is_some() {
            config.query.to = to.clone();
        }
        if let Some(resolution) = resolution {
            config.query.resolution = resolution.clone();
        }
    }

    let runner = ReportRunner::new(config).context("Failed to prepare report run")?;
    let span = info_span!("report", run_id = %Uuid::new_v4());

    run_report(&runner, cli.command).instrument(span).await
}

/// Run the selected report and print it as JSON on stdout.
async fn run_report(runner: &ReportRunner, command: Option<Commands>) -> AnyhowResult<()> {
    info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match command {
        Some(Commands::Catalog) => print_json(&runner.metric_catalog().await?),
        Some(Commands::Datapoints { metric, .. }) => print_json(&runner.datapoints(&metric).await?),
        Some(Commands::Synthetic) => print_json(&runner.synthetic_usage().await?),
        Some(Commands::Hosts) | None => print_json(&runner.host_utilization().await?),
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => Ok(()),
    }
}

// ============================================================================
// SECTION 14: TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("builtin:host.cpu.usage", "builtin:host.cpu.usage", Shape::Series)]
    #[case("builtin:host.cpu.usage:names", "builtin:host.cpu.usage", Shape::Series)]
    #[case("builtin:host.cpu.usage:fold", "builtin:host.cpu.usage", Shape::Folded)]
    #[case("builtin:host.cpu.usage:merge(1)", "builtin:host.cpu.usage", Shape::Series)]
    #[case("builtin:host.disk.usedPct:fold:merge(1)", "builtin:host.disk.usedPct", Shape::Folded)]
    #[case("builtin:service.response.time:fold(avg)", "builtin:service.response.time", Shape::Folded)]
    #[case("builtin:service.response.time:percentile(90)", "builtin:service.response.time", Shape::Series)]
    #[case("builtin:host.net.nic.trafficIn:avg", "builtin:host.net.nic.trafficIn", Shape::Series)]
    fn test_metric_key_normalization(#[case] raw: &str, #[case] normalized: &str, #[case] shape: Shape) {
        let key = MetricKey::parse(raw);
        assert_eq!(key.raw(), raw);
        assert_eq!(key.normalized(), normalized);
        assert_eq!(key.shape(), shape);
    }

    #[test]
    fn test_nested_fold_argument_kept_in_key() {
        let key = MetricKey::parse("builtin:host.cpu.usage:fold(value(avg))");
        assert_eq!(key.normalized(), "builtin:host.cpu.usage:fold(value(avg))");
        assert!(key.decorations().is_empty());
        assert_eq!(key.shape(), Shape::Series);
    }

    #[test]
    fn test_metric_key_decorations_in_order() {
        let key = MetricKey::parse("builtin:host.disk.usedPct:fold:merge(1)");
        assert_eq!(
            key.decorations(),
            &[Decoration::Fold(None), Decoration::Merge("1".into())]
        );

        let key = MetricKey::parse("builtin:host.cpu.usage:names");
        assert!(key.is_names());
        assert!(!key.without_names().is_names());
        assert_eq!(key.without_names().raw(), "builtin:host.cpu.usage");
    }

    #[test]
    fn test_actions_per_year() {
        assert_eq!(actions_per_year(60, 3, 2), 52_560.0);
        assert_eq!(actions_per_year(5, 1, 1), 105_120.0);
        assert_eq!(actions_per_year(0, 4, 3), 0.0);
    }

    #[test]
    fn test_monitor_type_classification() {
        assert_eq!(MonitorType::classify("HTTP", 5), MonitorType::Http);
        assert_eq!(MonitorType::classify("BROWSER", 3), MonitorType::BrowserClickpath);
        assert_eq!(MonitorType::classify("BROWSER", 1), MonitorType::Browser);
        assert_eq!(MonitorType::BrowserClickpath.to_string(), "Browser Clickpath");
    }

    #[test]
    fn test_api_request_continuation_keeps_only_cursor() {
        let request = QueryConfig::default().series_request("builtin:host.mem.usage");
        assert_eq!(request.get("metricSelector"), Some("builtin:host.mem.usage"));
        assert_eq!(request.get("pageSize"), Some("300"));
        assert_eq!(request.get("to"), None);

        let next = request.continuation("abc");
        assert_eq!(next.path, METRICS_QUERY_PATH);
        assert_eq!(next.query, vec![(NEXT_PAGE_KEY_PARAM.to_string(), "abc".to_string())]);
        assert_eq!(next.to_string(), "/api/v2/metrics/query?nextPageKey=abc");
    }

    #[test]
    fn test_http_transport_url_and_auth() {
        let credentials = tenant_credentials();
        let transport = HttpTransport::new(&credentials, &HttpConfig::default()).unwrap();
        let request = ApiRequest::new(METRICS_QUERY_PATH).param("metricSelector", "builtin:host.cpu.usage:names");

        let url = transport.url_for(&request).unwrap();
        assert_eq!(
            url.as_str(),
            "https://tenant.example.com/api/v2/metrics/query?metricSelector=builtin%3Ahost.cpu.usage%3Anames"
        );
        assert_eq!(transport.authorization, "Api-Token dt0c01.secret");
    }

    #[test]
    fn test_api_error_message() {
        let body = r#"{"error":{"code":401,"message":"Token is missing required scope"}}"#;
        assert_eq!(api_error_message(body), "Token is missing required scope");

        let long = "x".repeat(MAX_ERROR_BODY_CHARS * 2);
        assert_eq!(api_error_message(&long).len(), MAX_ERROR_BODY_CHARS);
    }

    #[test]
    fn test_error_categories() {
        let config: ReportError = ConfigError::missing_field("tenant.url").into();
        assert_eq!(config.category(), "config");
        assert!(!config.is_recoverable());
        assert_eq!(config.recovery_hint(), RecoveryHint::FixConfiguration);

        let unauthorized: ReportError = TransportError::rejected("u", 401, "no").into();
        assert_eq!(unauthorized.recovery_hint(), RecoveryHint::FixConfiguration);

        let server: ReportError = TransportError::rejected("u", 503, "busy").into();
        assert!(server.is_recoverable());
        assert_eq!(server.recovery_hint(), RecoveryHint::Skip);

        let no_data = ReportError::NoData { selector: "m".into() };
        assert_eq!(no_data.category(), "no_data");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_700_000_000_000), "11/14/2023 22:13");
        assert_eq!(format_timestamp(0), "01/01/1970 00:00");
    }

    #[test]
    fn test_percent_to_fraction() {
        assert!((percent_to_fraction(42.126) - 0.4213).abs() < 1e-9);
        assert_eq!(percent_to_fraction(0.0), 0.0);
    }

    fn tenant_credentials() -> Credentials {
        test_support::tenant_config().require_credentials().unwrap()
    }
}

#[cfg(test)]
mod config_tests {
    use super::test_support::tenant_config;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = ReportConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.query.selectors.len(), DEFAULT_HOST_SELECTORS.len());
        assert_eq!(config.query.page_size, DEFAULT_QUERY_PAGE_SIZE);
        assert_eq!(config.query.catalog_page_size, DEFAULT_CATALOG_PAGE_SIZE);
        assert_eq!(config.query.from, "now-2w");
        assert_eq!(config.query.resolution, "1d");
        assert_eq!(config.monitors.concurrency, DEFAULT_MONITOR_CONCURRENCY);
        assert_eq!(config.tenant.auth_scheme, "Api-Token");
    }

    #[test]
    fn test_config_from_str() {
        let config = ReportConfig::from_toml_str(
            r#"
            [tenant]
            url = "https://abc123.live.example.com/"
            api_token = "dt0c01.token"

            [query]
            resolution = "1h"
            to = "now-1d"

            [monitors]
            concurrency = 4
            cost_per_action = 0.001
            "#,
        )
        .unwrap();

        assert_eq!(config.query.resolution, "1h");
        assert_eq!(config.query.to.as_deref(), Some("now-1d"));
        assert_eq!(config.query.page_size, DEFAULT_QUERY_PAGE_SIZE);
        assert_eq!(config.monitors.concurrency, 4);

        let credentials = config.require_credentials().unwrap();
        assert_eq!(credentials.base_url, "https://abc123.live.example.com");
        assert_eq!(credentials.authorization(), "Api-Token dt0c01.token");
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let err = ReportConfig::from_toml_str("[query]\nresolution = \"2d\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "query.resolution"));

        let err = ReportConfig::from_toml_str("[query]\npage_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "query.page_size"));

        let err = ReportConfig::from_toml_str("[monitors]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "monitors.concurrency"));

        let err = ReportConfig::from_toml_str("[monitors]\ncost_per_action = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "monitors.cost_per_action"));

        let err = ReportConfig::from_toml_str("[query]\nselectors = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "query.selectors"));
    }

    #[test]
    fn test_missing_credentials() {
        let err = ReportConfig::default().require_credentials().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field } if field == "tenant.url"));

        let mut config = tenant_config();
        config.tenant.api_token = Some("   ".into());
        let err = config.require_credentials().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field } if field == "tenant.api_token"));
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[tenant]\nurl = \"https://tenant.example.com\"\napi_token = \"tok\"\n\n[http]\ntimeout_secs = 10"
        )
        .unwrap();

        let config = ReportConfig::load(file.path()).unwrap();
        assert_eq!(config.http.timeout_secs, 10);
        assert_eq!(config.tenant.url.as_deref(), Some("https://tenant.example.com"));
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReportConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = ReportConfig::generate_default_config();
        let config = ReportConfig::from_toml_str(&generated).unwrap();
        assert_eq!(config.query.selectors, ReportConfig::default().query.selectors);
        assert!(!generated.contains("api_token"));
    }

    #[test]
    fn test_tenant_debug_redacts_token() {
        let rendered = format!("{:?}", tenant_config().tenant);
        assert!(!rendered.contains("dt0c01.secret"));
        assert!(rendered.contains("<redacted>"));
    }
}



#[cfg(test)]
mod enrichment_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TENANT: &str = "https://tenant.example.com";

    fn detail_for(entity_id: &str) -> Option<JsonValue> {
        match entity_id {
            "A" => Some(json!({
                "entityId": "A",
                "name": "Checkout flow",
                "enabled": true,
                "frequencyMin": 60,
                "tags": [{ "key": "prod" }, { "key": "checkout" }],
                "events": [{}, {}, {}],
                "locations": 2,
                "type": "BROWSER"
            })),
            "B" => Some(json!({
                "entityId": "B",
                "name": "Legacy ping",
                "enabled": false,
                "frequencyMin": 15,
                "tags": [],
                "locations": ["GEOLOCATION-1"],
                "type": "HTTP"
            })),
            "C" => Some(json!({
                "name": "Home page",
                "enabled": true,
                "frequencyMin": 0,
                "tags": [],
                "events": "not-a-list",
                "locations": ["GEOLOCATION-1", "GEOLOCATION-2"],
                "type": "BROWSER"
            })),
            "T" => Some(json!({
                "entityId": "T",
                "name": "Untagged check",
                "enabled": true,
                "frequencyMin": 60,
                "locations": ["GEOLOCATION-1"],
                "type": "HTTP"
            })),
            "BAD" => Some(json!({
                "name": "Broken",
                "enabled": true,
                "frequencyMin": 10,
                "tags": [],
                "locations": "everywhere",
                "type": "HTTP"
            })),
            _ => None,
        }
    }

    fn monitor_api(listing: &'static [&'static str]) -> Arc<FixtureTransport> {
        FixtureTransport::new(move |req| {
            if req.path == SYNTHETIC_MONITORS_PATH {
                let monitors: Vec<JsonValue> = listing.iter().map(|id| json!({ "entityId": id })).collect();
                return Ok(json!({ "monitors": monitors }).to_string());
            }
            let id = req.path.rsplit('/').next().unwrap_or_default();
            detail_for(id).map(|d| d.to_string()).ok_or_else(|| not_found(req))
        })
    }

    fn enricher(transport: Arc<FixtureTransport>) -> EntityEnrichment {
        EntityEnrichment::new(transport, TENANT, 4)
    }

    #[tokio::test]
    async fn test_active_and_inactive_partition() {
        let enrichment = enricher(monitor_api(&["A", "B"])).enrich_listing().await.unwrap();

        assert_eq!(enrichment.active.len(), 1);
        assert_eq!(enrichment.inactive.len(), 1);
        assert!(enrichment.skipped.is_empty());

        let a = &enrichment.active[0];
        assert_eq!(a.entity_id, "A");
        assert_eq!(a.steps, 3);
        assert_eq!(a.locations, 2);
        assert_eq!(a.actions_per_year, 52_560.0);
        assert_eq!(a.monitor_type, MonitorType::BrowserClickpath);
        assert_eq!(a.tag_display, "prod, checkout");
        assert_eq!(a.link, "https://tenant.example.com/#monitordetailkpm;webcheckId=A");
        assert_eq!(a.cost, None);

        let b = &enrichment.inactive[0];
        assert_eq!(b.entity_id, "B");
        assert_eq!(b.steps, DEFAULT_STEP_COUNT);
        assert_eq!(b.monitor_type, MonitorType::Http);
        assert_eq!(b.tag_display, "");
        assert_eq!(b.link, "https://tenant.example.com/#httpcheckdetails;id=B");
        assert_eq!(b.cost, Some(CostMarker::NotApplicable));
    }

    #[tokio::test]
    async fn test_cost_marker_serialization() {
        let enrichment = enricher(monitor_api(&["A", "B"])).enrich_listing().await.unwrap();

        let active = serde_json::to_value(&enrichment.active[0]).unwrap();
        let inactive = serde_json::to_value(&enrichment.inactive[0]).unwrap();
        assert!(active.get("cost").is_none());
        assert_eq!(inactive["cost"], json!("n/a"));
        assert_eq!(inactive["monitor_type"], json!("HTTP"));
    }

    #[tokio::test]
    async fn test_failed_detail_is_skipped() {
        let ids: Vec<String> = ["A", "MISSING", "B"].iter().map(|s| s.to_string()).collect();
        let enrichment = enricher(monitor_api(&[])).enrich(&ids).await;

        assert_eq!(enrichment.total(), ids.len());
        assert_eq!(enrichment.active[0].entity_id, "A");
        assert_eq!(enrichment.inactive[0].entity_id, "B");
        assert_eq!(enrichment.skipped.len(), 1);
        assert_eq!(enrichment.skipped[0].entity_id, "MISSING");
        assert!(enrichment.skipped[0].error.contains("404"));
    }

    #[tokio::test]
    async fn test_malformed_locations_skipped() {
        let ids = vec!["BAD".to_string(), "A".to_string()];
        let enrichment = enricher(monitor_api(&[])).enrich(&ids).await;

        assert_eq!(enrichment.active.len(), 1);
        assert_eq!(enrichment.skipped[0].entity_id, "BAD");
        assert!(enrichment.skipped[0].error.contains("locations"));
    }

    #[tokio::test]
    async fn test_defaults_for_partial_detail() {
        let enrichment = enricher(monitor_api(&[])).enrich(&["C".to_string()]).await;
        let c = &enrichment.active[0];

        assert_eq!(c.entity_id, "C");
        assert_eq!(c.steps, DEFAULT_STEP_COUNT);
        assert_eq!(c.locations, 2);
        assert_eq!(c.monitor_type, MonitorType::Browser);
        assert_eq!(c.actions_per_year, 0.0);
    }

    #[tokio::test]
    async fn test_missing_tags_default_to_empty() {
        let enrichment = enricher(monitor_api(&[])).enrich(&["T".to_string()]).await;

        assert!(enrichment.skipped.is_empty());
        assert_eq!(enrichment.active.len(), 1);
        let t = &enrichment.active[0];
        assert_eq!(t.entity_id, "T");
        assert!(t.tags.is_empty());
        assert_eq!(t.tag_display, "");
        assert_eq!(t.actions_per_year, 8_760.0);
    }

    #[tokio::test]
    async fn test_listing_order_preserved() {
        let ids: Vec<String> = (0..12).map(|i| format!("M{}", i)).collect();
        let transport = FixtureTransport::new(|req| {
            let id = req.path.rsplit('/').next().unwrap_or_default();
            let index: usize = id.trim_start_matches('M').parse().map_err(|_| not_found(req))?;
            Ok(json!({
                "entityId": id,
                "name": format!("Monitor {}", index),
                "enabled": index % 3 != 0,
                "frequencyMin": 10 + index,
                "tags": [],
                "locations": 1,
                "type": "HTTP"
            })
            .to_string())
        });
        let enrichment = EntityEnrichment::new(transport.clone(), TENANT, 4).enrich(&ids).await;

        let active: Vec<&str> = enrichment.active.iter().map(|m| m.entity_id.as_str()).collect();
        let inactive: Vec<&str> = enrichment.inactive.iter().map(|m| m.entity_id.as_str()).collect();
        assert_eq!(active, vec!["M1", "M2", "M4", "M5", "M7", "M8", "M10", "M11"]);
        assert_eq!(inactive, vec!["M0", "M3", "M6", "M9"]);
        assert_eq!(transport.calls().len(), ids.len());
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let transport = FixtureTransport::new(|req| Err(TransportError::rejected(req.to_string(), 403, "forbidden")));
        let err = enricher(transport).enrich_listing().await.unwrap_err();

        assert!(matches!(
            err,
            ReportError::Transport(TransportError::Rejected { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_annual_cost() {
        let enrichment = enricher(monitor_api(&["A", "B"])).enrich_listing().await.unwrap();

        let cost = enrichment.active[0].annual_cost(0.001).unwrap();
        assert!((cost - 52.56).abs() < 1e-9);
        assert_eq!(enrichment.inactive[0].annual_cost(0.001), None);

        let report = SyntheticReport::new(enrichment, Some(0.001));
        assert_eq!(report.total_active_actions, 52_560.0);
        assert!((report.total_annual_cost.unwrap() - 52.56).abs() < 1e-9);
    }
}
