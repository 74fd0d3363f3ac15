//! # Regime Sentinel Engine
//!
//! An always-on host monitoring agent. It samples resource usage on a fixed
//! cadence, looks for abrupt level shifts ("regime shifts") in those series and
//! drives an operational mode machine that an operator steers through a small
//! command API.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          REGIME SENTINEL ENGINE                           │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ADAPTERS → SAMPLER → WINDOW → ANALYZER → MODE MACHINE → STORE / NOTIFY   │
//! │                                              ▲                            │
//! │                         COMMAND API (in-process handle / unix socket)     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded memory**: a fixed-capacity sliding window of samples
//! - **Change-point detection**: a deterministic two-segment separation score
//! - **Early-warning indicators**: variance and autocorrelation trends
//! - **Operator in the loop**: stabilization is only entered on command
//! - **Single owner**: one actor task owns every piece of mutable state

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, grouped by concern.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as TokioMutex};
use tokio::task::{self, JoinHandle as TokioJoinHandle};
use tokio::time::{interval, interval_at, sleep_until, timeout, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::{smallvec, SmallVec};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::{ProcessStatus, System as SysInfoSystem};

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & Validation
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use validator::{Validate, ValidationError};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and hard limits for sampling, detection and the mode machine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "sentinel-engine";
pub const ENGINE_FULL_NAME: &str = "Regime Sentinel Engine";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default cadence of the metrics sampler (seconds)
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 6;

/// Default cadence of the regime analyzer (seconds)
pub const DEFAULT_ANALYSIS_INTERVAL_SECS: u64 = 30;

/// Upper bound on a single adapter query (milliseconds)
pub const DEFAULT_ADAPTER_TIMEOUT_MS: u64 = 2_000;

/// Share of the adapter timeout the connectivity probe may spend on HTTP.
pub const CONNECTIVITY_TIMEOUT_FRACTION: f64 = 0.8;

/// How long stabilization holds before returning to observation (seconds)
pub const DEFAULT_STABILIZATION_DWELL_SECS: u64 = 120;

/// Upper bound on a load-shedding request (seconds)
pub const DEFAULT_SHEDDER_TIMEOUT_SECS: u64 = 10;

/// Delay before retrying a timed stabilization exit the store refused
pub const DWELL_RETRY_DELAY_SECS: u64 = 5;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

/// Ticks slower than this are logged at warn level (milliseconds)
pub const TICK_WARN_THRESHOLD_MS: u64 = 500;

// ----------------------------------------------------------------------------
// Settings Ranges
// ----------------------------------------------------------------------------

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;
pub const MIN_CONFIDENCE_THRESHOLD: f64 = 0.5;
pub const MAX_CONFIDENCE_THRESHOLD: f64 = 0.95;

pub const DEFAULT_WINDOW_SIZE: usize = 50;
pub const MIN_WINDOW_SIZE: usize = 10;
pub const MAX_WINDOW_SIZE: usize = 200;

// ----------------------------------------------------------------------------
// Detection
// ----------------------------------------------------------------------------

/// Analysis is skipped below this many samples
pub const MIN_ANALYSIS_SAMPLES: usize = 5;

/// Minimum points on each side of a candidate split
pub const CHANGE_POINT_MARGIN: usize = 3;

/// Added to the pooled deviation so flat segments do not divide by zero
pub const SEPARATION_EPSILON: f64 = 0.001;

/// Separation scores are capped here
pub const MAX_CHANGE_PROBABILITY: f64 = 0.95;

pub const CRITICAL_MAGNITUDE: f64 = 0.8;
pub const HIGH_MAGNITUDE: f64 = 0.6;
pub const MEDIUM_MAGNITUDE: f64 = 0.4;

/// Probability carried by the synthetic finding of `testWarning`
pub const TEST_WARNING_PROBABILITY: f64 = 0.85;

/// Rolling window and stride for early-warning indicators
pub const DEFAULT_EARLY_WARNING_WINDOW: usize = 10;
pub const DEFAULT_EARLY_WARNING_STEP: usize = 2;

/// Mean return time (samples) above which a series is slow to recover
pub const RETURN_TIME_THRESHOLD: f64 = 20.0;

/// Low/high band power ratio above which a series counts as reddened
pub const SPECTRAL_RATIO_THRESHOLD: f64 = 2.0;
pub const LOW_FREQUENCY_BAND: f64 = 0.1;
pub const HIGH_FREQUENCY_BAND: f64 = 0.4;

/// Early-warning score a prediction must exceed to flag a coming shift
pub const DEFAULT_PREDICTION_THRESHOLD: f64 = 0.6;

/// Confidence multiplier when variance and autocorrelation both rise
pub const AGREEMENT_BOOST: f64 = 1.2;

// ----------------------------------------------------------------------------
// Mitigation
// ----------------------------------------------------------------------------

/// Minimum warning confidence before high-risk actions are suggested
pub const HIGH_RISK_CONFIDENCE_GATE: f64 = 0.9;

/// Minimum warning confidence for every other risk level
pub const DEFAULT_CONFIDENCE_GATE: f64 = 0.8;

// ----------------------------------------------------------------------------
// Channels & IPC
// ----------------------------------------------------------------------------

/// Pending operator commands before senders wait
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Buffered alerts per broadcast subscriber
pub const ALERT_BROADCAST_CAPACITY: usize = 256;

/// Default Unix socket path for the command API
pub const DEFAULT_UNIX_SOCKET_PATH: &str = "/tmp/regime-sentinel.sock";

/// Default location of the JSON state file
pub const DEFAULT_STATE_FILE: &str = "sentinel-state.json";

/// Probed with a HEAD request; any HTTP answer counts as online
pub const DEFAULT_CONNECTIVITY_PROBE_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data that flows from the adapters through the window into analysis:
// - Timestamps and severities
// - Operational modes
// - Metric samples and the fallback-aware readings they are built from
// - The bounded sliding window
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is later
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Severity
// ----------------------------------------------------------------------------

/// Severity level for findings and notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    /// Informational - no action needed
    Info = 0,
    /// Low severity - can be addressed later
    Low = 1,
    /// Medium severity - should be addressed soon
    Medium = 2,
    /// High severity - needs attention
    High = 3,
    /// Critical severity - immediate action required
    Critical = 4,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Operational Mode
// ----------------------------------------------------------------------------

/// The agent's operational mode.
///
/// `AdaptiveObservation` is the resting state. `Warning` is entered when the
/// analyzer confirms a shift; `Stabilization` only ever on operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    #[default]
    AdaptiveObservation,
    Warning,
    Stabilization,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::AdaptiveObservation => "adaptiveObservation",
            Mode::Warning => "warning",
            Mode::Stabilization => "stabilization",
        }
    }

    /// Value exported on the mode gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            Mode::AdaptiveObservation => 0,
            Mode::Warning => 1,
            Mode::Stabilization => 2,
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Metric Samples
// ----------------------------------------------------------------------------

/// Which host adapter produced a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterKind {
    Memory,
    Cpu,
    WorkloadUnits,
    Connectivity,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 4] = [
        AdapterKind::Memory,
        AdapterKind::Cpu,
        AdapterKind::WorkloadUnits,
        AdapterKind::Connectivity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Memory => "memory",
            AdapterKind::Cpu => "cpu",
            AdapterKind::WorkloadUnits => "workloadUnits",
            AdapterKind::Connectivity => "connectivity",
        }
    }
}

impl Display for AdapterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    pub available_bytes: u64,
    pub capacity_bytes: u64,
    pub usage_percent: f64,
}

impl MemorySnapshot {
    pub fn from_bytes(available_bytes: u64, capacity_bytes: u64) -> Self {
        let usage_percent = if capacity_bytes == 0 {
            0.0
        } else {
            capacity_bytes.saturating_sub(available_bytes) as f64 / capacity_bytes as f64 * 100.0
        };
        Self {
            available_bytes,
            capacity_bytes,
            usage_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuSnapshot {
    pub logical_processors: usize,
    pub usage_percent: f64,
}

impl Default for CpuSnapshot {
    fn default() -> Self {
        Self {
            logical_processors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            usage_percent: 0.0,
        }
    }
}

/// Workload units are OS processes: all of them, and those currently running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSnapshot {
    pub total: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivitySnapshot {
    pub online: bool,
}

impl Default for ConnectivitySnapshot {
    /// Unknown connectivity is reported as online
    fn default() -> Self {
        Self { online: true }
    }
}

/// One point-in-time observation of the host. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: Timestamp,
    pub memory: MemorySnapshot,
    pub cpu: CpuSnapshot,
    pub workload_units: WorkloadSnapshot,
    pub connectivity: ConnectivitySnapshot,
    /// Adapters whose value in this sample is a fallback
    #[serde(default)]
    pub degraded: SmallVec<[AdapterKind; 4]>,
}

impl MetricSample {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 3.5 Readings - Measured or Fallback
// ----------------------------------------------------------------------------

/// A value read from an adapter, tagged with whether it was really measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> {
    Measured(T),
    Degraded(T),
}

impl<T> Reading<T> {
    /// Keep the measured value, or fall back when the adapter failed
    pub fn from_result<E>(result: Result<T, E>, fallback: impl FnOnce() -> T) -> Self {
        match result {
            Ok(value) => Reading::Measured(value),
            Err(_) => Reading::Degraded(fallback()),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Reading::Measured(v) | Reading::Degraded(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Reading::Measured(v) | Reading::Degraded(v) => v,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Reading::Degraded(_))
    }
}

// ----------------------------------------------------------------------------
// 3.6 Metric Window - Bounded FIFO of Samples
// ----------------------------------------------------------------------------

/// Ordered, bounded history of samples. Oldest samples are evicted first.
///
/// The capacity is passed on every push so a settings change takes effect on
/// the next sampler tick without rebuilding the window.
#[derive(Debug, Clone, Default)]
pub struct MetricWindow {
    samples: VecDeque<MetricSample>,
}

impl MetricWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a sample and evict down to `capacity`. Returns the evicted count.
    pub fn push(&mut self, sample: MetricSample, capacity: usize) -> usize {
        self.samples.push_back(sample);
        self.truncate_to(capacity)
    }

    /// Drop the oldest samples until at most `capacity` remain
    pub fn truncate_to(&mut self, capacity: usize) -> usize {
        let excess = self.samples.len().saturating_sub(capacity);
        self.samples.drain(..excess);
        excess
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter()
    }

    /// Point-in-time copy for analysis
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.samples.iter().cloned().collect()
    }

    /// Project one numeric series out of the window, oldest first
    pub fn series<F>(&self, extract: F) -> Vec<f64>
    where
        F: Fn(&MetricSample) -> f64,
    {
        self.samples.iter().map(extract).collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod core_type_tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_at(millis: i64) -> MetricSample {
        MetricSample {
            timestamp: Timestamp::from_millis(millis),
            memory: MemorySnapshot::from_bytes(4, 8),
            cpu: CpuSnapshot { logical_processors: 4, usage_percent: 10.0 },
            workload_units: WorkloadSnapshot { total: 100, active: 3 },
            connectivity: ConnectivitySnapshot { online: true },
            degraded: SmallVec::new(),
        }
    }

    #[test]
    fn test_memory_usage_percent() {
        let snapshot = MemorySnapshot::from_bytes(25, 100);
        assert!((snapshot.usage_percent - 75.0).abs() < 1e-9);
        assert_eq!(MemorySnapshot::from_bytes(0, 0).usage_percent, 0.0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_mode_serializes_camel_case() {
        assert_eq!(serde_json::to_value(Mode::AdaptiveObservation).unwrap(), json!("adaptiveObservation"));
        assert_eq!(Mode::Stabilization.to_string(), "stabilization");
    }

    #[test]
    fn test_reading_fallback() {
        let measured: Reading<u32> = Reading::from_result(Ok::<_, ()>(7), || 0);
        let degraded: Reading<u32> = Reading::from_result(Err(()), || 3);
        assert!(!measured.is_degraded());
        assert!(degraded.is_degraded());
        assert_eq!(degraded.into_inner(), 3);
    }

    #[test]
    fn test_window_evicts_oldest_first() {
        let mut window = MetricWindow::with_capacity(10);
        for i in 0..12 {
            window.push(sample_at(i), 10);
        }
        assert_eq!(window.len(), 10);
        assert_eq!(window.iter().next().unwrap().timestamp, Timestamp::from_millis(2));
        assert_eq!(window.latest().unwrap().timestamp, Timestamp::from_millis(11));
    }

    #[test]
    fn test_window_shrinks_on_next_push() {
        let mut window = MetricWindow::default();
        for i in 0..50 {
            window.push(sample_at(i), 50);
        }
        let evicted = window.push(sample_at(50), 10);
        assert_eq!(evicted, 41);
        assert_eq!(window.len(), 10);
    }

    #[test]
    fn test_sample_json_shape() {
        let value = serde_json::to_value(sample_at(1)).unwrap();
        assert!(value["memory"]["usagePercent"].is_number());
        assert!(value["workloadUnits"]["total"].is_number());
        assert_eq!(value["connectivity"]["online"], json!(true));
        assert_eq!(value["degraded"], json!([]));
    }

    proptest! {
        #[test]
        fn prop_window_never_exceeds_capacity(pushes in 0usize..400, capacity in 10usize..=200) {
            let mut window = MetricWindow::default();
            for i in 0..pushes {
                window.push(sample_at(i as i64), capacity);
                prop_assert!(window.len() <= capacity);
            }
            prop_assert_eq!(window.len(), pushes.min(capacity));
            if pushes > 0 {
                prop_assert_eq!(window.latest().unwrap().timestamp, Timestamp::from_millis(pushes as i64 - 1));
            }
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types per subsystem, all convertible into `SentinelError`.
// Nothing here is fatal to the agent loop; every error carries a category
// and a recovery hint so callers can log and carry on.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the sentinel engine.
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Mitigation error: {0}")]
    Mitigation(#[from] MitigationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl SentinelError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SentinelError::Config(_) => false,
            SentinelError::Collector(e) => e.is_recoverable(),
            SentinelError::Storage(e) => e.is_recoverable(),
            SentinelError::Command(_) => true,
            SentinelError::Mitigation(_) => true,
            SentinelError::Serialization(_) => true,
            SentinelError::Io(_) => true,
            SentinelError::Internal(_) => false,
            SentinelError::ShuttingDown => false,
        }
    }

    /// Error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            SentinelError::Config(_) => "config",
            SentinelError::Collector(_) => "collector",
            SentinelError::Storage(_) => "storage",
            SentinelError::Command(_) => "command",
            SentinelError::Mitigation(_) => "mitigation",
            SentinelError::Serialization(_) => "serialization",
            SentinelError::Io(_) => "io",
            SentinelError::Internal(_) => "internal",
            SentinelError::ShuttingDown => "shutdown",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SentinelError::Config(_) => RecoveryHint::FixConfiguration,
            SentinelError::Collector(e) => e.recovery_hint(),
            SentinelError::Storage(_) => RecoveryHint::RetryWithBackoff,
            SentinelError::Command(_) => RecoveryHint::Skip,
            SentinelError::Mitigation(_) => RecoveryHint::AlertOperator,
            SentinelError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Fall back to the previous value and continue
    UseFallback,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Collector Errors
// ----------------------------------------------------------------------------

/// Errors from host metric adapters
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collection failed for '{adapter}': {message}")]
    CollectionFailed { adapter: String, message: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Adapter '{adapter}' is unavailable on this host")]
    Unavailable { adapter: String },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CollectorError::Unavailable { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CollectorError::Timeout { .. } => RecoveryHint::UseFallback,
            CollectorError::CollectionFailed { .. } => RecoveryHint::UseFallback,
            CollectorError::Unavailable { .. } => RecoveryHint::FixConfiguration,
        }
    }

    pub fn collection_failed(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::CollectionFailed {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        CollectorError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the persistent state store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Serialization of '{key}' failed: {message}")]
    SerializationFailed { key: String, message: String },

    #[error("Deserialization of '{key}' failed: {message}")]
    DeserializationFailed { key: String, message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Data corruption detected: {message}")]
    DataCorruption { message: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::DataCorruption { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.5 Command Errors
// ----------------------------------------------------------------------------

/// Errors answered to command API callers
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    #[error("Invalid payload for '{action}': {message}")]
    InvalidPayload { action: String, message: String },

    #[error("Action '{action}' is not valid in mode {mode}")]
    InvalidState { action: String, mode: Mode },

    #[error("Agent is not running")]
    AgentUnavailable,
}

impl CommandError {
    pub fn invalid_payload(action: impl Into<String>, message: impl Into<String>) -> Self {
        CommandError::InvalidPayload {
            action: action.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Mitigation Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum MitigationError {
    #[error("Mitigation action '{action}' failed: {message}")]
    Failed { action: String, message: String },

    #[error("Load shedder did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for sentinel operations
pub type SentinelResult<T> = Result<T, SentinelError>;

/// Result type for adapter queries
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Result type for state store operations
pub type StorageResult<T> = Result<T, StorageError>;

pub type MitigationResult<T> = Result<T, MitigationError>;

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err: SentinelError = CollectorError::timeout("memory", 2000).into();
        assert_eq!(err.category(), "collector");
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::UseFallback);

        let err: SentinelError = ConfigError::invalid_value("sampling.interval", "must be non-zero").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_storage_corruption_is_not_recoverable() {
        let err = StorageError::DataCorruption { message: "bad json".into() };
        assert!(!err.is_recoverable());
        assert!(StorageError::WriteFailed { message: "disk full".into() }.is_recoverable());
    }

    #[test]
    fn test_command_error_messages() {
        let err = CommandError::InvalidState { action: "exitStabilization".into(), mode: Mode::Warning };
        assert_eq!(err.to_string(), "Action 'exitStabilization' is not valid in mode warning");
        let err = CommandError::UnknownAction { action: "selfDestruct".into() };
        assert_eq!(err.to_string(), "Unknown action: selfDestruct");
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with:
// - Serialized defaults, file values and SENTINEL_* environment overrides
// - Human-readable durations ("6s", "2m")
// - Range validation through `validator` plus cross-field checks
// - Runtime settings that operators can patch field by field
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the sentinel agent
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AgentConfig {
    #[serde(default)]
    #[validate]
    pub agent: GeneralConfig,

    #[serde(default)]
    #[validate]
    pub sampling: SamplingConfig,

    #[serde(default)]
    #[validate]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    #[validate]
    pub stabilization: StabilizationConfig,

    /// Settings in effect until an operator changes them
    #[serde(default)]
    #[validate]
    pub defaults: Settings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[validate]
    pub command: CommandConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path)))
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Self::default())))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed("SENTINEL_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges, then the constraints between sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::ValidationFailed {
            message: e.to_string(),
        })?;

        if self.analysis.interval < self.sampling.interval {
            return Err(ConfigError::invalid_value(
                "analysis.interval",
                format!(
                    "analysis interval ({}) must not be shorter than the sampling interval ({})",
                    humantime::format_duration(self.analysis.interval),
                    humantime::format_duration(self.sampling.interval)
                ),
            ));
        }

        if self.sampling.adapter_timeout >= self.sampling.interval {
            return Err(ConfigError::invalid_value(
                "sampling.adapter_timeout",
                "adapter timeout must be shorter than the sampling interval",
            ));
        }

        if self.analysis.early_warning.step >= self.analysis.early_warning.window {
            return Err(ConfigError::invalid_value(
                "analysis.early_warning.step",
                "step must be smaller than the rolling window",
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn validate_nonzero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.2 General Agent Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GeneralConfig {
    /// Name used in logs and notifications
    #[serde(default = "default_instance_name")]
    #[validate(length(min = 1))]
    pub instance_name: String,

    /// How long shutdown waits for the agent loop
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "sentinel".into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Sampling Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SamplingConfig {
    /// Time between samples
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    #[validate(custom = "validate_nonzero_duration")]
    pub interval: Duration,

    /// Upper bound on each adapter query
    #[serde(default = "default_adapter_timeout", with = "humantime_serde")]
    #[validate(custom = "validate_nonzero_duration")]
    pub adapter_timeout: Duration,

    /// Target of the connectivity HEAD probe
    #[serde(default = "default_probe_url")]
    #[validate(length(min = 1))]
    pub connectivity_probe_url: String,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: default_sample_interval(),
            adapter_timeout: default_adapter_timeout(),
            connectivity_probe_url: default_probe_url(),
        }
    }
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS)
}

fn default_adapter_timeout() -> Duration {
    Duration::from_millis(DEFAULT_ADAPTER_TIMEOUT_MS)
}

fn default_probe_url() -> String {
    DEFAULT_CONNECTIVITY_PROBE_URL.into()
}

// ----------------------------------------------------------------------------
// 5.4 Analysis Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnalysisConfig {
    /// Time between analyses
    #[serde(default = "default_analysis_interval", with = "humantime_serde")]
    #[validate(custom = "validate_nonzero_duration")]
    pub interval: Duration,

    /// Series the detector runs over
    #[serde(default = "default_tracked_metrics")]
    #[validate(length(min = 1))]
    pub tracked_metrics: Vec<TrackedMetric>,

    #[serde(default)]
    #[validate]
    pub early_warning: EarlyWarningConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval: default_analysis_interval(),
            tracked_metrics: default_tracked_metrics(),
            early_warning: EarlyWarningConfig::default(),
        }
    }
}

fn default_analysis_interval() -> Duration {
    Duration::from_secs(DEFAULT_ANALYSIS_INTERVAL_SECS)
}

fn default_tracked_metrics() -> Vec<TrackedMetric> {
    vec![TrackedMetric::Memory, TrackedMetric::Cpu]
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EarlyWarningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rolling window length in samples
    #[serde(default = "default_early_warning_window")]
    #[validate(range(min = 4, max = 100))]
    pub window: usize,

    /// Stride between rolling windows
    #[serde(default = "default_early_warning_step")]
    #[validate(range(min = 1, max = 50))]
    pub step: usize,

    /// Score a regime-shift prediction must exceed
    #[serde(default = "default_prediction_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub prediction_threshold: f64,
}

impl Default for EarlyWarningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: default_early_warning_window(),
            step: default_early_warning_step(),
            prediction_threshold: default_prediction_threshold(),
        }
    }
}

fn default_early_warning_window() -> usize {
    DEFAULT_EARLY_WARNING_WINDOW
}

fn default_early_warning_step() -> usize {
    DEFAULT_EARLY_WARNING_STEP
}

fn default_prediction_threshold() -> f64 {
    DEFAULT_PREDICTION_THRESHOLD
}

// ----------------------------------------------------------------------------
// 5.5 Stabilization Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StabilizationConfig {
    /// How long stabilization holds before the timed return
    #[serde(default = "default_dwell", with = "humantime_serde")]
    #[validate(custom = "validate_nonzero_duration")]
    pub dwell: Duration,

    /// Highest risk level the stabilization plan may include
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: RiskLevel,

    /// Upper bound on a load-shedding request
    #[serde(default = "default_action_timeout", with = "humantime_serde")]
    #[validate(custom = "validate_nonzero_duration")]
    pub action_timeout: Duration,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            dwell: default_dwell(),
            risk_tolerance: default_risk_tolerance(),
            action_timeout: default_action_timeout(),
        }
    }
}

fn default_dwell() -> Duration {
    Duration::from_secs(DEFAULT_STABILIZATION_DWELL_SECS)
}

fn default_risk_tolerance() -> RiskLevel {
    RiskLevel::Medium
}

fn default_action_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHEDDER_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.6 Storage & Command Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Lost on restart
    Memory,
    /// JSON document on local disk
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// State file used by the file backend
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_state_path(),
        }
    }
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CommandConfig {
    /// Serve the command API on a Unix socket
    #[serde(default = "default_true")]
    pub socket_enabled: bool,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Pending commands before callers wait
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, max = 4096))]
    pub queue_capacity: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            socket_enabled: true,
            socket_path: default_socket_path(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_UNIX_SOCKET_PATH)
}

fn default_queue_capacity() -> usize {
    COMMAND_QUEUE_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,

    /// Directory for daily-rotated JSON log files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stdout: true,
            colors: true,
            source_location: false,
            directory: None,
            file_prefix: default_log_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_prefix() -> String {
    "sentinel.log".into()
}

// ----------------------------------------------------------------------------
// 5.8 Runtime Settings
// ----------------------------------------------------------------------------

/// Operator-tunable settings. Persisted under the `settings` store key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Findings require a probability strictly above this
    #[serde(default = "default_confidence_threshold", alias = "confidence_threshold")]
    #[validate(range(min = 0.5, max = 0.95))]
    pub confidence_threshold: f64,

    /// Capacity of the sample window
    #[serde(default = "default_window_size", alias = "window_size")]
    #[validate(range(min = 10, max = 200))]
    pub window_size: usize,

    /// When false, sampler and analyzer ticks do nothing
    #[serde(default = "default_true", alias = "monitoring_enabled")]
    pub monitoring_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            window_size: default_window_size(),
            monitoring_enabled: true,
        }
    }
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

/// A settings field the operator tried to change but could not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedField {
    pub field: CompactString,
    pub reason: String,
}

/// Outcome of merging a partial settings update
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    /// The merged settings; rejected fields keep their prior value
    pub settings: Settings,
    pub applied: Vec<CompactString>,
    pub rejected: Vec<RejectedField>,
}

impl SettingsUpdate {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

impl Settings {
    /// Merge a partial JSON update. Each field is checked on its own; a bad
    /// field is reported and skipped while the good ones still apply.
    pub fn merge_patch(&self, patch: &JsonValue) -> Result<SettingsUpdate, CommandError> {
        let object = patch
            .as_object()
            .ok_or_else(|| CommandError::invalid_payload("updateSettings", "expected a JSON object"))?;

        let mut settings = *self;
        let mut applied = Vec::new();
        let mut rejected = Vec::new();

        for (field, value) in object {
            let outcome = match field.as_str() {
                "confidenceThreshold" => parse_confidence_threshold(value).map(|v| settings.confidence_threshold = v),
                "windowSize" => parse_window_size(value).map(|v| settings.window_size = v),
                "monitoringEnabled" => value
                    .as_bool()
                    .ok_or_else(|| "expected a boolean".to_string())
                    .map(|v| settings.monitoring_enabled = v),
                _ => Err("unknown setting".to_string()),
            };

            match outcome {
                Ok(()) => applied.push(CompactString::from(field.as_str())),
                Err(reason) => rejected.push(RejectedField {
                    field: CompactString::from(field.as_str()),
                    reason,
                }),
            }
        }

        Ok(SettingsUpdate {
            settings,
            applied,
            rejected,
        })
    }
}

fn parse_confidence_threshold(value: &JsonValue) -> Result<f64, String> {
    let threshold = value.as_f64().ok_or_else(|| "expected a number".to_string())?;
    if !(MIN_CONFIDENCE_THRESHOLD..=MAX_CONFIDENCE_THRESHOLD).contains(&threshold) {
        return Err(format!(
            "must be within [{}, {}]",
            MIN_CONFIDENCE_THRESHOLD, MAX_CONFIDENCE_THRESHOLD
        ));
    }
    Ok(threshold)
}

fn parse_window_size(value: &JsonValue) -> Result<usize, String> {
    let size = value
        .as_u64()
        .ok_or_else(|| "expected a non-negative integer".to_string())?;
    let size = usize::try_from(size).map_err(|_| format!("must be within [{}, {}]", MIN_WINDOW_SIZE, MAX_WINDOW_SIZE))?;
    if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&size) {
        return Err(format!("must be within [{}, {}]", MIN_WINDOW_SIZE, MAX_WINDOW_SIZE));
    }
    Ok(size)
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_config_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampling.interval, Duration::from_secs(6));
        assert_eq!(config.analysis.interval, Duration::from_secs(30));
        assert_eq!(config.stabilization.dwell, Duration::from_secs(120));
        assert_eq!(config.defaults, Settings::default());
        assert_eq!(config.analysis.tracked_metrics, vec![TrackedMetric::Memory, TrackedMetric::Cpu]);
    }

    #[test]
    fn test_config_from_toml() {
        let config = AgentConfig::from_str(
            r#"
            [sampling]
            interval = "3s"

            [analysis]
            interval = "15s"
            tracked_metrics = ["memory", "cpu", "activeWorkloadUnits"]

            [stabilization]
            dwell = "90s"
            risk_tolerance = "low"

            [defaults]
            confidenceThreshold = 0.8
            windowSize = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.sampling.interval, Duration::from_secs(3));
        assert_eq!(config.analysis.tracked_metrics.len(), 3);
        assert_eq!(config.stabilization.risk_tolerance, RiskLevel::Low);
        assert_eq!(config.defaults.window_size, 100);
        assert!(config.defaults.monitoring_enabled);
    }

    #[test]
    fn test_config_rejects_out_of_range_threshold() {
        let err = AgentConfig::from_str("[defaults]\nconfidenceThreshold = 0.99\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed { .. }));
    }

    #[test]
    fn test_config_rejects_analysis_faster_than_sampling() {
        let err = AgentConfig::from_str("[analysis]\ninterval = \"1s\"\n").unwrap_err();
        match err {
            ConfigError::InvalidValue { field, .. } => assert_eq!(field, "analysis.interval"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = AgentConfig::generate_default_config();
        assert!(rendered.contains("[sampling]"));
        let parsed = AgentConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.sampling.interval, AgentConfig::default().sampling.interval);
    }

    #[test]
    fn test_settings_patch_applies_valid_fields() {
        let update = Settings::default()
            .merge_patch(&json!({"confidenceThreshold": 0.9, "windowSize": 20, "monitoringEnabled": false}))
            .unwrap();
        assert!(update.is_clean());
        assert_eq!(
            update.settings,
            Settings { confidence_threshold: 0.9, window_size: 20, monitoring_enabled: false }
        );
        assert_eq!(update.applied.len(), 3);
    }

    #[rstest]
    #[case(json!({"confidenceThreshold": 0.3}), "confidenceThreshold")]
    #[case(json!({"confidenceThreshold": "high"}), "confidenceThreshold")]
    #[case(json!({"windowSize": 5}), "windowSize")]
    #[case(json!({"windowSize": 12.5}), "windowSize")]
    #[case(json!({"windowSize": u64::MAX}), "windowSize")]
    #[case(json!({"windowSize": 4_294_967_346u64}), "windowSize")]
    #[case(json!({"windowSize": -20}), "windowSize")]
    #[case(json!({"monitoringEnabled": "yes"}), "monitoringEnabled")]
    #[case(json!({"pollRate": 3}), "pollRate")]
    fn test_settings_patch_rejects_field(#[case] patch: JsonValue, #[case] field: &str) {
        let update = Settings::default().merge_patch(&patch).unwrap();
        assert_eq!(update.settings, Settings::default());
        assert_eq!(update.rejected.len(), 1);
        assert_eq!(update.rejected[0].field.as_str(), field);
    }

    #[test]
    fn test_settings_patch_is_partial() {
        let update = Settings::default()
            .merge_patch(&json!({"confidenceThreshold": 2.0, "windowSize": 150}))
            .unwrap();
        assert_eq!(update.settings.window_size, 150);
        assert_eq!(update.settings.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(update.applied, vec![CompactString::from("windowSize")]);
        assert!(!update.is_clean());
    }

    #[test]
    fn test_settings_patch_requires_object() {
        let err = Settings::default().merge_patch(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload { .. }));
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with:
// - pretty / compact / json stdout formats
// - optional daily-rotated JSON files through a non-blocking writer
// - RUST_LOG overrides on top of the configured level
// - component targets under `sentinel::*`
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Keeps the non-blocking file writer flushing until dropped
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn parse_level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> SentinelResult<LoggingGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level_filter(&config.level).into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stdout {
        let layer = match config.format {
            LogFormat::Json => tracing_fmt::layer()
                .json()
                .with_timer(tracing_fmt::time::SystemTime)
                .with_target(true)
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .boxed(),
            LogFormat::Compact => tracing_fmt::layer()
                .compact()
                .with_ansi(config.colors)
                .with_target(true)
                .boxed(),
            LogFormat::Pretty => tracing_fmt::layer()
                .pretty()
                .with_ansi(config.colors)
                .with_target(true)
                .with_file(config.source_location)
                .with_line_number(config.source_location)
                .with_thread_names(true)
                .boxed(),
        };
        layers.push(layer);
    }

    let mut file_guard = None;
    if let Some(directory) = &config.directory {
        let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| SentinelError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "sentinel::init",
        level = %config.level,
        format = ?config.format,
        file_output = config.directory.is_some(),
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

// ----------------------------------------------------------------------------
// 6.2 Logging Macros for Engine Components
// ----------------------------------------------------------------------------

/// Log an alert event
#[macro_export]
macro_rules! log_alert {
    ($severity:expr, $message:expr) => {
        tracing::warn!(
            target: "sentinel::alerts",
            severity = %$severity,
            detail = $message,
            "Alert triggered"
        )
    };
    ($severity:expr, $message:expr, $($field:tt)*) => {
        tracing::warn!(
            target: "sentinel::alerts",
            severity = %$severity,
            detail = $message,
            $($field)*,
            "Alert triggered"
        )
    };
}

/// Log an adapter event
#[macro_export]
macro_rules! log_collector {
    ($adapter:expr, $event:expr) => {
        tracing::debug!(
            target: "sentinel::adapters",
            adapter = %$adapter,
            event = $event,
            "Adapter event"
        )
    };
    ($adapter:expr, $event:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "sentinel::adapters",
            adapter = %$adapter,
            event = $event,
            $($field)*,
            "Adapter event"
        )
    };
}

/// Log a mode transition
#[macro_export]
macro_rules! log_transition {
    ($from:expr, $to:expr, $cause:expr) => {
        tracing::info!(
            target: "sentinel::mode",
            from = %$from,
            to = %$to,
            cause = $cause,
            "Mode transition"
        )
    };
}

// ----------------------------------------------------------------------------
// 6.3 Performance Timer
// ----------------------------------------------------------------------------

/// Measures one tick and warns when it runs past its threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
    stopped: bool,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
            stopped: false,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            threshold_ms: Some(threshold_ms),
            ..Self::new(name)
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(mut self) -> u64 {
        self.stopped = true;
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "sentinel::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "sentinel::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !self.stopped {
            trace!(
                target: "sentinel::perf",
                operation = self.name,
                elapsed_ms = self.elapsed_ms(),
                "Timer dropped"
            );
        }
    }
}

#[cfg(test)]
mod logging_tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(parse_level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(parse_level_filter("warning"), LevelFilter::WARN);
        assert_eq!(parse_level_filter("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_perf_timer_reports_elapsed() {
        let timer = PerfTimer::with_threshold("unit", 10_000);
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.stop() < 10_000);
    }
}

// ============================================================================
// SECTION 7: METRIC SOURCE ADAPTERS & SAMPLER
// ============================================================================
// Adapters answer four independent questions about the host. The sampler
// asks all four on every tick, bounds each answer with a timeout and falls
// back to the previous sample when an adapter cannot answer.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Adapter Trait
// ----------------------------------------------------------------------------

/// The host-facing queries behind a sample. Each call may fail on its own.
#[async_trait]
pub trait MetricAdapters: Send + Sync {
    async fn memory(&self) -> CollectorResult<MemorySnapshot>;

    async fn cpu(&self) -> CollectorResult<CpuSnapshot>;

    async fn workload_units(&self) -> CollectorResult<WorkloadSnapshot>;

    async fn connectivity(&self) -> CollectorResult<ConnectivitySnapshot>;
}

// ----------------------------------------------------------------------------
// 7.2 Host Adapters - sysinfo + HTTP probe
// ----------------------------------------------------------------------------

/// HTTP budget of the connectivity probe. It ends before the sampler's own
/// timeout so an unanswered probe reports offline instead of degrading.
pub fn connectivity_timeout(adapter_timeout: Duration) -> Duration {
    adapter_timeout.mul_f64(CONNECTIVITY_TIMEOUT_FRACTION)
}

/// Production adapters backed by `sysinfo` and a connectivity probe.
///
/// `sysinfo` calls block, so they run on the blocking pool. The `System` is
/// kept between ticks because CPU usage is measured between two refreshes.
pub struct HostAdapters {
    system: Arc<Mutex<SysInfoSystem>>,
    http: HttpClient,
    probe_url: String,
}

impl HostAdapters {
    pub fn new(config: &SamplingConfig) -> SentinelResult<Self> {
        let http = HttpClient::builder()
            .timeout(connectivity_timeout(config.adapter_timeout))
            .user_agent(format!("{}/{}", ENGINE_NAME, ENGINE_VERSION))
            .build()
            .map_err(|e| CollectorError::collection_failed(AdapterKind::Connectivity.as_str(), e.to_string()))?;

        Ok(Self {
            system: Arc::new(Mutex::new(SysInfoSystem::new())),
            http,
            probe_url: config.connectivity_probe_url.clone(),
        })
    }

    async fn with_system<T, F>(&self, adapter: AdapterKind, query: F) -> CollectorResult<T>
    where
        F: FnOnce(&mut SysInfoSystem) -> CollectorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let system = Arc::clone(&self.system);
        task::spawn_blocking(move || {
            let mut system = system.lock();
            query(&mut *system)
        })
        .await
        .map_err(|e| CollectorError::collection_failed(adapter.as_str(), e.to_string()))?
    }
}

#[async_trait]
impl MetricAdapters for HostAdapters {
    async fn memory(&self) -> CollectorResult<MemorySnapshot> {
        self.with_system(AdapterKind::Memory, |system| {
            system.refresh_memory();
            let capacity = system.total_memory();
            if capacity == 0 {
                return Err(CollectorError::collection_failed(
                    AdapterKind::Memory.as_str(),
                    "host reported zero memory capacity",
                ));
            }
            Ok(MemorySnapshot::from_bytes(system.available_memory(), capacity))
        })
        .await
    }

    async fn cpu(&self) -> CollectorResult<CpuSnapshot> {
        self.with_system(AdapterKind::Cpu, |system| {
            system.refresh_cpu();
            let logical_processors = system.cpus().len();
            if logical_processors == 0 {
                return Err(CollectorError::Unavailable {
                    adapter: AdapterKind::Cpu.as_str().into(),
                });
            }
            Ok(CpuSnapshot {
                logical_processors,
                usage_percent: f64::from(system.global_cpu_info().cpu_usage()),
            })
        })
        .await
    }

    async fn workload_units(&self) -> CollectorResult<WorkloadSnapshot> {
        self.with_system(AdapterKind::WorkloadUnits, |system| {
            system.refresh_processes();
            let processes = system.processes();
            let active = processes
                .values()
                .filter(|process| process.status() == ProcessStatus::Run)
                .count();
            Ok(WorkloadSnapshot {
                total: processes.len() as u64,
                active: active as u64,
            })
        })
        .await
    }

    async fn connectivity(&self) -> CollectorResult<ConnectivitySnapshot> {
        match self.http.head(&self.probe_url).send().await {
            Ok(response) => {
                log_collector!(AdapterKind::Connectivity, "probe_answered", status = response.status().as_u16());
                Ok(ConnectivitySnapshot { online: true })
            }
            Err(e) if e.is_builder() => Err(CollectorError::collection_failed(
                AdapterKind::Connectivity.as_str(),
                e.to_string(),
            )),
            Err(e) => {
                log_collector!(AdapterKind::Connectivity, "probe_failed", error = %e);
                Ok(ConnectivitySnapshot { online: false })
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Metrics Sampler
// ----------------------------------------------------------------------------

/// Builds one `MetricSample` per tick from the adapters.
pub struct Sampler {
    adapters: Arc<dyn MetricAdapters>,
    timeout: Duration,
    previous: Option<MetricSample>,
}

impl Sampler {
    pub fn new(adapters: Arc<dyn MetricAdapters>, timeout: Duration) -> Self {
        Self {
            adapters,
            timeout,
            previous: None,
        }
    }

    async fn bounded<T>(
        &self,
        adapter: AdapterKind,
        query: impl Future<Output = CollectorResult<T>>,
    ) -> CollectorResult<T> {
        match timeout(self.timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(CollectorError::timeout(adapter.as_str(), self.timeout.as_millis() as u64)),
        }
    }

    /// Query every adapter concurrently and assemble a sample. Never fails:
    /// adapters that error or time out contribute their fallback value.
    pub async fn sample(&mut self) -> MetricSample {
        let adapters = Arc::clone(&self.adapters);
        let (memory, cpu, workload_units, connectivity) = tokio::join!(
            self.bounded(AdapterKind::Memory, adapters.memory()),
            self.bounded(AdapterKind::Cpu, adapters.cpu()),
            self.bounded(AdapterKind::WorkloadUnits, adapters.workload_units()),
            self.bounded(AdapterKind::Connectivity, adapters.connectivity()),
        );

        let previous = self.previous.as_ref();
        let memory = resolve(AdapterKind::Memory, memory, || {
            previous.map(|p| p.memory).unwrap_or_default()
        });
        let cpu = resolve(AdapterKind::Cpu, cpu, || previous.map(|p| p.cpu).unwrap_or_default());
        let workload_units = resolve(AdapterKind::WorkloadUnits, workload_units, || {
            previous.map(|p| p.workload_units).unwrap_or_default()
        });
        let connectivity = resolve(AdapterKind::Connectivity, connectivity, || {
            previous.map(|p| p.connectivity).unwrap_or_default()
        });

        let mut degraded = SmallVec::new();
        for (kind, is_degraded) in [
            (AdapterKind::Memory, memory.is_degraded()),
            (AdapterKind::Cpu, cpu.is_degraded()),
            (AdapterKind::WorkloadUnits, workload_units.is_degraded()),
            (AdapterKind::Connectivity, connectivity.is_degraded()),
        ] {
            if is_degraded {
                degraded.push(kind);
            }
        }

        let sample = MetricSample {
            timestamp: Timestamp::now(),
            memory: memory.into_inner(),
            cpu: cpu.into_inner(),
            workload_units: workload_units.into_inner(),
            connectivity: connectivity.into_inner(),
            degraded,
        };

        self.previous = Some(sample.clone());
        sample
    }

    /// Forget the fallback source
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

fn resolve<T>(adapter: AdapterKind, result: CollectorResult<T>, fallback: impl FnOnce() -> T) -> Reading<T> {
    if let Err(e) = &result {
        warn!(
            target: "sentinel::sampler",
            adapter = %adapter,
            error = %e,
            "Adapter failed, using fallback value"
        );
    }
    Reading::from_result(result, fallback)
}

// ----------------------------------------------------------------------------
// 7.4 Test Fixtures
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const TEST_CAPACITY_BYTES: u64 = 16 * 1024 * 1024 * 1024;

    /// Adapters with operator-controlled values and failures
    #[derive(Debug)]
    pub struct ScriptedAdapters {
        memory_percent: Mutex<f64>,
        cpu_percent: Mutex<f64>,
        failing: Mutex<Vec<AdapterKind>>,
        stall: Mutex<Option<Duration>>,
    }

    impl ScriptedAdapters {
        pub fn steady(memory_percent: f64, cpu_percent: f64) -> Arc<Self> {
            Arc::new(Self {
                memory_percent: Mutex::new(memory_percent),
                cpu_percent: Mutex::new(cpu_percent),
                failing: Mutex::new(Vec::new()),
                stall: Mutex::new(None),
            })
        }

        pub fn set_memory(&self, percent: f64) {
            *self.memory_percent.lock() = percent;
        }

        pub fn fail(&self, adapter: AdapterKind) {
            self.failing.lock().push(adapter);
        }

        pub fn heal(&self) {
            self.failing.lock().clear();
        }

        pub fn stall_for(&self, delay: Duration) {
            *self.stall.lock() = Some(delay);
        }

        async fn gate(&self, adapter: AdapterKind) -> CollectorResult<()> {
            let stall = *self.stall.lock();
            if let Some(delay) = stall {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().contains(&adapter) {
                return Err(CollectorError::collection_failed(adapter.as_str(), "scripted failure"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MetricAdapters for ScriptedAdapters {
        async fn memory(&self) -> CollectorResult<MemorySnapshot> {
            self.gate(AdapterKind::Memory).await?;
            let percent = *self.memory_percent.lock();
            Ok(MemorySnapshot {
                available_bytes: (TEST_CAPACITY_BYTES as f64 * (100.0 - percent) / 100.0) as u64,
                capacity_bytes: TEST_CAPACITY_BYTES,
                usage_percent: percent,
            })
        }

        async fn cpu(&self) -> CollectorResult<CpuSnapshot> {
            self.gate(AdapterKind::Cpu).await?;
            Ok(CpuSnapshot {
                logical_processors: 8,
                usage_percent: *self.cpu_percent.lock(),
            })
        }

        async fn workload_units(&self) -> CollectorResult<WorkloadSnapshot> {
            self.gate(AdapterKind::WorkloadUnits).await?;
            Ok(WorkloadSnapshot { total: 240, active: 4 })
        }

        async fn connectivity(&self) -> CollectorResult<ConnectivitySnapshot> {
            self.gate(AdapterKind::Connectivity).await?;
            Ok(ConnectivitySnapshot { online: true })
        }
    }

    /// A sample with the given memory and cpu usage
    pub fn sample_with(memory_percent: f64, cpu_percent: f64) -> MetricSample {
        MetricSample {
            timestamp: Timestamp::now(),
            memory: MemorySnapshot {
                available_bytes: 0,
                capacity_bytes: TEST_CAPACITY_BYTES,
                usage_percent: memory_percent,
            },
            cpu: CpuSnapshot {
                logical_processors: 8,
                usage_percent: cpu_percent,
            },
            workload_units: WorkloadSnapshot { total: 240, active: 4 },
            connectivity: ConnectivitySnapshot { online: true },
            degraded: SmallVec::new(),
        }
    }

    /// Memory usage steps from 20% to 80% halfway through; cpu stays flat
    pub fn stepped_window(len: usize) -> Vec<MetricSample> {
        (0..len)
            .map(|i| sample_with(if i < len / 2 { 20.0 } else { 80.0 }, 35.0))
            .collect()
    }
}


// ============================================================================
// SECTION 8: CHANGE-POINT DETECTION
// ============================================================================
// A deterministic, bounded separation score between the two halves of every
// admissible split of a series. It is not a calibrated probability; it is
// named one on the wire for compatibility with consumers.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Result Type
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePointResult {
    /// Capped separation score in [0, 0.95]
    pub probability: f64,
    /// First index of the second segment, -1 when there is no candidate
    pub change_point_index: i64,
    pub magnitude: f64,
}

impl ChangePointResult {
    pub const NONE: ChangePointResult = ChangePointResult {
        probability: 0.0,
        change_point_index: -1,
        magnitude: 0.0,
    };

    pub fn has_candidate(&self) -> bool {
        self.change_point_index >= 0
    }
}

// ----------------------------------------------------------------------------
// 8.2 Statistics Helpers
// ----------------------------------------------------------------------------

/// Mean and population variance. Empty input yields zeros.
pub fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

/// Least-squares slope against the sample index
pub fn index_slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_xx: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        return 0.0;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    if slope.is_finite() {
        slope
    } else {
        0.0
    }
}

/// Pearson correlation between the series and itself shifted by one
pub fn lag_one_autocorrelation(values: &[f64]) -> f64 {
    if values.len() < 3 {
        return 0.0;
    }
    let head = &values[..values.len() - 1];
    let tail = &values[1..];
    let (mean_head, var_head) = mean_and_variance(head);
    let (mean_tail, var_tail) = mean_and_variance(tail);
    if var_head == 0.0 || var_tail == 0.0 {
        return 0.0;
    }
    let covariance = head
        .iter()
        .zip(tail)
        .map(|(a, b)| (a - mean_head) * (b - mean_tail))
        .sum::<f64>()
        / head.len() as f64;
    let correlation = covariance / (var_head.sqrt() * var_tail.sqrt());
    if correlation.is_finite() {
        correlation
    } else {
        0.0
    }
}

/// Population skewness. Zero for constant input.
pub fn skewness(values: &[f64]) -> f64 {
    let (mean, variance) = mean_and_variance(values);
    if variance == 0.0 {
        return 0.0;
    }
    let n = values.len() as f64;
    let third = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
    let skew = third / variance.powf(1.5);
    if skew.is_finite() {
        skew
    } else {
        0.0
    }
}

/// Ratio of mean low-frequency to mean high-frequency power of the linearly
/// detrended series. Frequencies are in cycles per sample; 1.0 when either
/// band is empty.
pub fn spectral_ratio(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 4 {
        return 1.0;
    }

    let slope = index_slope(values);
    let (mean, _) = mean_and_variance(values);
    let center = (n - 1) as f64 / 2.0;
    let detrended: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(i, v)| v - (mean + slope * (i as f64 - center)))
        .collect();

    let mut low = Vec::new();
    let mut high = Vec::new();
    for k in 1..=n / 2 {
        let frequency = k as f64 / n as f64;
        let (mut re, mut im) = (0.0, 0.0);
        for (i, v) in detrended.iter().enumerate() {
            let angle = std::f64::consts::TAU * frequency * i as f64;
            re += v * angle.cos();
            im -= v * angle.sin();
        }
        let power = (re * re + im * im) / n as f64;
        if frequency < LOW_FREQUENCY_BAND {
            low.push(power);
        } else if frequency > HIGH_FREQUENCY_BAND {
            high.push(power);
        }
    }

    if low.is_empty() || high.is_empty() {
        return 1.0;
    }
    let low_power = low.iter().sum::<f64>() / low.len() as f64;
    let high_power = high.iter().sum::<f64>() / high.len() as f64;
    let ratio = low_power / (high_power + 1e-10);
    if ratio.is_finite() {
        ratio
    } else {
        1.0
    }
}

// ----------------------------------------------------------------------------
// 8.3 Detector
// ----------------------------------------------------------------------------

/// Find the split that best separates the series into two segments.
///
/// Every split `i` in `[3, n-3)` is scored as
/// `|mean_left - mean_right| / (sqrt(var_left + var_right) + 0.001)`. The
/// highest raw score wins (ties go to the lowest index) and is then capped at
/// 0.95. Series shorter than seven points have no admissible split.
pub fn detect(series: &[f64]) -> ChangePointResult {
    if series.len() < 2 {
        return ChangePointResult::NONE;
    }

    let upper = series.len().saturating_sub(CHANGE_POINT_MARGIN);
    let mut best: Option<(usize, f64)> = None;

    for split in CHANGE_POINT_MARGIN..upper {
        let (left, right) = series.split_at(split);
        let (mean_left, var_left) = mean_and_variance(left);
        let (mean_right, var_right) = mean_and_variance(right);
        let score = (mean_left - mean_right).abs() / ((var_left + var_right).sqrt() + SEPARATION_EPSILON);
        let score = if score.is_finite() { score } else { 0.0 };

        if best.map_or(true, |(_, top)| score > top) {
            best = Some((split, score));
        }
    }

    match best {
        Some((split, score)) => {
            let capped = score.min(MAX_CHANGE_PROBABILITY);
            ChangePointResult {
                probability: capped,
                change_point_index: split as i64,
                magnitude: capped,
            }
        }
        None => ChangePointResult::NONE,
    }
}

// ----------------------------------------------------------------------------
// 8.4 Early-Warning Indicators
// ----------------------------------------------------------------------------

/// Critical-slowing-down indicators for one series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyWarningSignals {
    /// Slope of the rolling variance
    pub variance_trend: f64,
    /// Slope of the rolling lag-1 autocorrelation
    pub autocorrelation_trend: f64,
    /// Slope of the rolling skewness
    pub skewness_trend: f64,
    /// Mean samples between crossings of the series mean
    pub mean_return_time: f64,
    /// Low over high band power of the whole series
    pub spectral_ratio: f64,
    /// Composite in [0, 1]
    pub score: f64,
}

/// Whether a series looks set to shift, and how sure that call is
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeShiftPrediction {
    pub is_warning: bool,
    pub confidence: f64,
}

impl EarlyWarningSignals {
    /// Flags a coming shift when the score exceeds `threshold`. Confidence is
    /// the score, boosted when variance and autocorrelation rise together.
    pub fn predict_regime_shift(&self, threshold: f64) -> RegimeShiftPrediction {
        let mut confidence = self.score;
        if self.variance_trend > 0.0 && self.autocorrelation_trend > 0.0 {
            confidence *= AGREEMENT_BOOST;
        }
        RegimeShiftPrediction {
            is_warning: self.score > threshold,
            confidence: confidence.min(1.0),
        }
    }
}

/// Compute early-warning indicators over rolling windows of `window` points
/// taken every `step` points. Returns `None` when the series is too short.
pub fn early_warning_signals(series: &[f64], window: usize, step: usize) -> Option<EarlyWarningSignals> {
    if window < 3 || step == 0 || series.len() < window + step {
        return None;
    }

    let mut variances = Vec::new();
    let mut autocorrelations = Vec::new();
    let mut skews = Vec::new();
    let mut start = 0;
    while start + window <= series.len() {
        let chunk = &series[start..start + window];
        variances.push(mean_and_variance(chunk).1);
        autocorrelations.push(lag_one_autocorrelation(chunk));
        skews.push(skewness(chunk));
        start += step;
    }

    let variance_trend = index_slope(&variances);
    let autocorrelation_trend = index_slope(&autocorrelations);
    let skewness_trend = index_slope(&skews);
    let mean_return_time = mean_return_time(series);
    let spectral_ratio = spectral_ratio(series);

    let mut score: f64 = 0.0;
    if variance_trend > 0.0 {
        score += 0.3;
    }
    if autocorrelation_trend > 0.0 {
        score += 0.3;
    }
    if spectral_ratio > SPECTRAL_RATIO_THRESHOLD {
        score += 0.2;
    }
    if mean_return_time > RETURN_TIME_THRESHOLD {
        score += 0.2;
    }

    Some(EarlyWarningSignals {
        variance_trend,
        autocorrelation_trend,
        skewness_trend,
        mean_return_time,
        spectral_ratio,
        score: score.min(1.0),
    })
}

fn mean_return_time(series: &[f64]) -> f64 {
    let (mean, _) = mean_and_variance(series);
    let crossings: Vec<usize> = series
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| (pair[0] - mean) * (pair[1] - mean) < 0.0)
        .map(|(i, _)| i)
        .collect();

    if crossings.len() < 2 {
        return 0.0;
    }
    let gaps: Vec<f64> = crossings.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    gaps.iter().sum::<f64>() / gaps.len() as f64
}


// ============================================================================
// SECTION 9: REGIME ANALYZER
// ============================================================================
// Runs the detector independently over each tracked series of a window
// snapshot and turns results above the confidence threshold into findings.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Tracked Metrics
// ----------------------------------------------------------------------------

/// A numeric series that can be projected out of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedMetric {
    /// Memory usage percent
    Memory,
    /// Processor usage percent
    Cpu,
    /// Total workload units
    WorkloadUnits,
    /// Workload units currently running
    ActiveWorkloadUnits,
}

impl TrackedMetric {
    pub fn name(&self) -> &'static str {
        match self {
            TrackedMetric::Memory => "memory",
            TrackedMetric::Cpu => "cpu",
            TrackedMetric::WorkloadUnits => "workloadUnits",
            TrackedMetric::ActiveWorkloadUnits => "activeWorkloadUnits",
        }
    }

    pub fn extract(&self, sample: &MetricSample) -> f64 {
        match self {
            TrackedMetric::Memory => sample.memory.usage_percent,
            TrackedMetric::Cpu => sample.cpu.usage_percent,
            TrackedMetric::WorkloadUnits => sample.workload_units.total as f64,
            TrackedMetric::ActiveWorkloadUnits => sample.workload_units.active as f64,
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Findings & Reports
// ----------------------------------------------------------------------------

/// A confirmed shift in one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftFinding {
    pub metric_name: CompactString,
    pub probability: f64,
    pub change_point_index: i64,
    pub severity: Severity,
}

impl ShiftFinding {
    pub fn from_result(metric_name: impl Into<CompactString>, result: &ChangePointResult) -> Self {
        Self {
            metric_name: metric_name.into(),
            probability: result.probability,
            change_point_index: result.change_point_index,
            severity: severity_for_magnitude(result.magnitude),
        }
    }

    /// The finding injected by `testWarning`
    pub fn synthetic(window_len: usize) -> Self {
        Self::from_result(
            TrackedMetric::Memory.name(),
            &ChangePointResult {
                probability: TEST_WARNING_PROBABILITY,
                change_point_index: (window_len / 2) as i64,
                magnitude: TEST_WARNING_PROBABILITY,
            },
        )
    }
}

/// Map a detector magnitude onto a severity bucket
pub fn severity_for_magnitude(magnitude: f64) -> Severity {
    if magnitude > CRITICAL_MAGNITUDE {
        Severity::Critical
    } else if magnitude > HIGH_MAGNITUDE {
        Severity::High
    } else if magnitude > MEDIUM_MAGNITUDE {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesAnalysis {
    pub metric_name: CompactString,
    pub result: ChangePointResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_warning: Option<EarlyWarningSignals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<RegimeShiftPrediction>,
}

/// Everything one analysis pass produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub timestamp: Timestamp,
    pub sample_count: usize,
    pub series: Vec<SeriesAnalysis>,
    pub findings: Vec<ShiftFinding>,
}

impl AnalysisReport {
    pub fn shift_confirmed(&self) -> bool {
        !self.findings.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 9.3 Analyzer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegimeAnalyzer {
    tracked: SmallVec<[TrackedMetric; 4]>,
    early_warning: Option<EarlyWarningConfig>,
}

impl RegimeAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        let early_warning = config.early_warning.enabled.then(|| config.early_warning.clone());
        Self {
            tracked: config.tracked_metrics.iter().copied().collect(),
            early_warning,
        }
    }

    pub fn tracked(&self) -> &[TrackedMetric] {
        &self.tracked
    }

    /// Analyze a window snapshot. Returns `None` below the minimum sample count.
    pub fn analyze(&self, window: &[MetricSample], confidence_threshold: f64) -> Option<AnalysisReport> {
        if window.len() < MIN_ANALYSIS_SAMPLES {
            return None;
        }

        let series = self
            .tracked
            .iter()
            .map(|metric| (metric.name(), window.iter().map(|s| metric.extract(s)).collect::<Vec<_>>()));

        Some(self.analyze_series(series, confidence_threshold))
    }

    /// Analyze any named set of numeric series
    pub fn analyze_series<I, N>(&self, series: I, confidence_threshold: f64) -> AnalysisReport
    where
        I: IntoIterator<Item = (N, Vec<f64>)>,
        N: Into<CompactString>,
    {
        let mut sample_count = 0;
        let mut analyses = Vec::new();
        let mut findings = Vec::new();

        for (name, values) in series {
            let metric_name: CompactString = name.into();
            sample_count = sample_count.max(values.len());

            let result = detect(&values);
            let (early_warning, prediction) = match &self.early_warning {
                Some(ew) => {
                    let signals = early_warning_signals(&values, ew.window, ew.step);
                    let prediction = signals.map(|s| s.predict_regime_shift(ew.prediction_threshold));
                    (signals, prediction)
                }
                None => (None, None),
            };

            if result.probability > confidence_threshold {
                findings.push(ShiftFinding::from_result(metric_name.clone(), &result));
            }

            trace!(
                target: "sentinel::analyzer",
                metric = %metric_name,
                probability = result.probability,
                index = result.change_point_index,
                "Series analyzed"
            );

            analyses.push(SeriesAnalysis {
                metric_name,
                result,
                early_warning,
                prediction,
            });
        }

        AnalysisReport {
            timestamp: Timestamp::now(),
            sample_count,
            series: analyses,
            findings,
        }
    }
}


// ============================================================================
// SECTION 10: PERSISTENT STATE STORE
// ============================================================================
// A small key/value surface for the state that has to survive a restart.
// Values are JSON documents; typed access goes through `put_json`/`fetch_json`.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Store Keys & Trait
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    LatestSample,
    CurrentWarning,
    CurrentMode,
    StabilizationActive,
    Settings,
    LastStabilization,
}

impl StoreKey {
    pub const ALL: [StoreKey; 6] = [
        StoreKey::LatestSample,
        StoreKey::CurrentWarning,
        StoreKey::CurrentMode,
        StoreKey::StabilizationActive,
        StoreKey::Settings,
        StoreKey::LastStabilization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::LatestSample => "latestSample",
            StoreKey::CurrentWarning => "currentWarning",
            StoreKey::CurrentMode => "currentMode",
            StoreKey::StabilizationActive => "stabilizationActive",
            StoreKey::Settings => "settings",
            StoreKey::LastStabilization => "lastStabilization",
        }
    }
}

/// Persistent key/value store for agent state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: StoreKey, value: JsonValue) -> StorageResult<()>;

    async fn get(&self, key: StoreKey) -> StorageResult<Option<JsonValue>>;

    async fn remove(&self, key: StoreKey) -> StorageResult<()>;

    async fn clear(&self) -> StorageResult<()>;
}

pub async fn put_json<T>(store: &dyn StateStore, key: StoreKey, value: &T) -> StorageResult<()>
where
    T: Serialize + ?Sized + Sync,
{
    let json = serde_json::to_value(value).map_err(|e| StorageError::SerializationFailed {
        key: key.as_str().into(),
        message: e.to_string(),
    })?;
    store.set(key, json).await
}

pub async fn fetch_json<T: DeserializeOwned>(store: &dyn StateStore, key: StoreKey) -> StorageResult<Option<T>> {
    match store.get(key).await? {
        Some(json) => serde_json::from_value(json)
            .map(Some)
            .map_err(|e| StorageError::DeserializationFailed {
                key: key.as_str().into(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

// ----------------------------------------------------------------------------
// 10.2 In-Memory Store
// ----------------------------------------------------------------------------

/// Volatile store; state is lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<StoreKey, JsonValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: StoreKey) -> bool {
        self.entries.contains_key(&key)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set(&self, key: StoreKey, value: JsonValue) -> StorageResult<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: StoreKey) -> StorageResult<Option<JsonValue>> {
        Ok(self.entries.get(&key).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, key: StoreKey) -> StorageResult<()> {
        self.entries.remove(&key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.entries.clear();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 10.3 JSON File Store
// ----------------------------------------------------------------------------

/// One JSON document on disk, rewritten through a temp file and a rename
/// so a crash never leaves a half-written state file behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: TokioMutex<BTreeMap<String, JsonValue>>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::DataCorruption {
                message: format!("{}: {}", path.display(), e),
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StorageError::ReadFailed {
                    message: format!("{}: {}", path.display(), e),
                })
            }
        };

        debug!(
            target: "sentinel::store",
            path = %path.display(),
            keys = state.len(),
            "State file opened"
        );

        Ok(Self {
            path,
            state: TokioMutex::new(state),
        })
    }

    /// Like `open`, but a corrupt state file is moved aside and the store
    /// starts empty.
    pub async fn open_or_recover(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        match Self::open(&path).await {
            Err(StorageError::DataCorruption { message }) => {
                let mut aside = path.clone().into_os_string();
                aside.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
                let aside = PathBuf::from(aside);

                tokio::fs::rename(&path, &aside)
                    .await
                    .map_err(|e| StorageError::WriteFailed {
                        message: format!("{}: {}", aside.display(), e),
                    })?;

                warn!(
                    target: "sentinel::store",
                    error = %message,
                    moved_to = %aside.display(),
                    "Corrupt state file moved aside, starting empty"
                );
                Self::open(path).await
            }
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &BTreeMap<String, JsonValue>) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| StorageError::SerializationFailed {
            key: "*".into(),
            message: e.to_string(),
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::WriteFailed {
                message: format!("{}: {}", tmp.display(), e),
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::WriteFailed {
                message: format!("{}: {}", self.path.display(), e),
            })
    }

    /// Apply `change` to a copy of the state and commit it only once written
    async fn update<F>(&self, change: F) -> StorageResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, JsonValue>) + Send,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        change(&mut next);
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn set(&self, key: StoreKey, value: JsonValue) -> StorageResult<()> {
        self.update(move |state| {
            state.insert(key.as_str().to_string(), value);
        })
        .await
    }

    async fn get(&self, key: StoreKey) -> StorageResult<Option<JsonValue>> {
        Ok(self.state.lock().await.get(key.as_str()).cloned())
    }

    async fn remove(&self, key: StoreKey) -> StorageResult<()> {
        self.update(move |state| {
            state.remove(key.as_str());
        })
        .await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.update(|state| state.clear()).await
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        put_json(&store, StoreKey::CurrentMode, &Mode::Warning).await.unwrap();
        put_json(&store, StoreKey::StabilizationActive, &false).await.unwrap();

        let mode: Option<Mode> = fetch_json(&store, StoreKey::CurrentMode).await.unwrap();
        assert_eq!(mode, Some(Mode::Warning));

        store.remove(StoreKey::CurrentMode).await.unwrap();
        assert!(!store.contains(StoreKey::CurrentMode));
        store.clear().await.unwrap();
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_fetch_reports_type_mismatch() {
        let store = MemoryStore::new();
        store.set(StoreKey::Settings, json!("not settings")).await.unwrap();
        let err = fetch_json::<Settings>(&store, StoreKey::Settings).await.unwrap_err();
        assert!(matches!(err, StorageError::DeserializationFailed { .. }));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            put_json(&store, StoreKey::Settings, &Settings::default()).await.unwrap();
            put_json(&store, StoreKey::CurrentMode, &Mode::Stabilization).await.unwrap();
            store.remove(StoreKey::CurrentMode).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let settings: Option<Settings> = fetch_json(&reopened, StoreKey::Settings).await.unwrap();
        assert_eq!(settings, Some(Settings::default()));
        assert_eq!(reopened.get(StoreKey::CurrentMode).await.unwrap(), None);

        reopened.clear().await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.trim(), "{}");
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::open(&path).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::open_or_recover(&path).await.unwrap();
        assert_eq!(store.get(StoreKey::CurrentMode).await.unwrap(), None);
        assert!(!path.exists());

        let moved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("state.json.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join(&moved[0])).unwrap(), "{ not json");

        store.set(StoreKey::CurrentMode, json!("stabilization")).await.unwrap();
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(StoreKey::CurrentMode).await.unwrap(), Some(json!("stabilization")));
    }

    #[tokio::test]
    async fn test_recovery_keeps_a_healthy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        JsonFileStore::open(&path)
            .await
            .unwrap()
            .set(StoreKey::CurrentMode, json!("adaptiveObservation"))
            .await
            .unwrap();

        let store = JsonFileStore::open_or_recover(&path).await.unwrap();
        assert_eq!(store.get(StoreKey::CurrentMode).await.unwrap(), Some(json!("adaptiveObservation")));
    }
}

// ============================================================================
// SECTION 11: NOTIFICATIONS
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Alerts
// ----------------------------------------------------------------------------

/// A user-visible notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: Timestamp,
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Timestamp::now(),
            severity,
            title: title.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Notification Sinks
// ----------------------------------------------------------------------------

/// Delivery of user-visible notifications. Failures never roll back state.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> SentinelResult<()>;
}

/// Writes notifications to the `sentinel::alerts` log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> SentinelResult<()> {
        log_alert!(severity, message, title = title);
        Ok(())
    }
}

/// Fans notifications out to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Arc<Alert>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Alert>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(ALERT_BROADCAST_CAPACITY)
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> SentinelResult<()> {
        let alert = Arc::new(Alert::new(title, message, severity));
        if self.sender.send(alert).is_err() {
            debug!(target: "sentinel::alerts", title, "No subscribers for alert");
        }
        Ok(())
    }
}

/// Delivers to several sinks; one failing sink does not stop the others
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn notify(&self, title: &str, message: &str, severity: Severity) -> SentinelResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(title, message, severity).await {
                warn!(target: "sentinel::alerts", error = %e, "Notification sink failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod notification_tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_delivers_alert() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.notify("Regime shift detected", "memory shifted", Severity::High)
            .await
            .unwrap();

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.title, "Regime shift detected");
        assert_eq!(alert.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_not_an_error() {
        let sink = BroadcastSink::new(8);
        assert!(sink.notify("t", "m", Severity::Low).await.is_ok());
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let first = BroadcastSink::new(4);
        let second = BroadcastSink::new(4);
        let mut rx_first = first.subscribe();
        let mut rx_second = second.subscribe();
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink), Arc::new(first), Arc::new(second)];
        let fanout = FanoutSink::new(sinks);

        fanout.notify("t", "m", Severity::Medium).await.unwrap();
        assert_eq!(rx_first.recv().await.unwrap().message, "m");
        assert_eq!(rx_second.recv().await.unwrap().message, "m");
    }
}

// ============================================================================
// SECTION 12: MITIGATION CATALOG & LOAD SHEDDING
// ============================================================================
// Reversible host load-shedding actions, each with a risk level. Warnings
// carry confidence-gated suggestions; stabilization runs every action within
// the configured risk tolerance through the `LoadShedder`.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Actions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Minimum warning confidence before an action of this risk is suggested
    pub fn confidence_gate(&self) -> f64 {
        match self {
            RiskLevel::High => HIGH_RISK_CONFIDENCE_GATE,
            RiskLevel::Low | RiskLevel::Medium => DEFAULT_CONFIDENCE_GATE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationAction {
    pub id: CompactString,
    pub description: CompactString,
    pub risk_level: RiskLevel,
    pub reversible: bool,
    pub estimated_seconds: u32,
}

impl MitigationAction {
    fn new(id: &str, description: &str, risk_level: RiskLevel, reversible: bool, estimated_seconds: u32) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            risk_level,
            reversible,
            estimated_seconds,
        }
    }
}

/// The built-in action catalog
pub fn mitigation_catalog() -> Vec<MitigationAction> {
    vec![
        MitigationAction::new(
            "pause_background_workloads",
            "Pause non-essential background workload units",
            RiskLevel::Low,
            true,
            5,
        ),
        MitigationAction::new(
            "lower_workload_priority",
            "Lower the scheduling priority of the busiest workload units",
            RiskLevel::Low,
            true,
            5,
        ),
        MitigationAction::new(
            "suspend_idle_workloads",
            "Suspend idle workload units to release memory",
            RiskLevel::Medium,
            true,
            15,
        ),
        MitigationAction::new(
            "restart_runaway_workload",
            "Restart the workload unit with the steepest resource growth",
            RiskLevel::High,
            false,
            60,
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationSuggestion {
    pub action: MitigationAction,
    pub explanation: String,
}

// ----------------------------------------------------------------------------
// 12.2 Policy
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MitigationPolicy {
    catalog: Vec<MitigationAction>,
    risk_tolerance: RiskLevel,
}

impl MitigationPolicy {
    pub fn new(risk_tolerance: RiskLevel) -> Self {
        Self::with_catalog(mitigation_catalog(), risk_tolerance)
    }

    pub fn with_catalog(catalog: Vec<MitigationAction>, risk_tolerance: RiskLevel) -> Self {
        Self {
            catalog,
            risk_tolerance,
        }
    }

    /// Actions whose confidence gate the warning clears
    pub fn suggestions(&self, confidence: f64) -> Vec<MitigationSuggestion> {
        self.catalog
            .iter()
            .filter(|action| confidence >= action.risk_level.confidence_gate())
            .map(|action| MitigationSuggestion {
                action: action.clone(),
                explanation: format!(
                    "{:.0}% confidence clears the {:.0}% gate for {}-risk actions{}",
                    confidence * 100.0,
                    action.risk_level.confidence_gate() * 100.0,
                    action.risk_level.as_str(),
                    if action.reversible { "" } else { "; this action cannot be undone" }
                ),
            })
            .collect()
    }

    /// Actions stabilization runs: reversible and within the risk tolerance
    pub fn stabilization_plan(&self) -> Vec<MitigationAction> {
        self.catalog
            .iter()
            .filter(|action| action.reversible && action.risk_level <= self.risk_tolerance)
            .cloned()
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 12.3 Load Shedder
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub action_id: CompactString,
    pub succeeded: bool,
    pub detail: String,
}

/// Host-side executor of load-shedding plans
#[async_trait]
pub trait LoadShedder: Send + Sync {
    async fn apply(&self, plan: &[MitigationAction]) -> MitigationResult<Vec<ActionOutcome>>;

    /// Undo whatever `apply` did
    async fn restore(&self) -> MitigationResult<()>;
}

/// Records the plan in the log and reports every action as applied.
/// Hosts that can actually shed load plug in their own implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingShedder;

#[async_trait]
impl LoadShedder for LoggingShedder {
    async fn apply(&self, plan: &[MitigationAction]) -> MitigationResult<Vec<ActionOutcome>> {
        Ok(plan
            .iter()
            .map(|action| {
                info!(
                    target: "sentinel::mitigation",
                    action = %action.id,
                    risk = action.risk_level.as_str(),
                    "Load-shedding action requested"
                );
                ActionOutcome {
                    action_id: action.id.clone(),
                    succeeded: true,
                    detail: "delegated to host".into(),
                }
            })
            .collect())
    }

    async fn restore(&self) -> MitigationResult<()> {
        info!(target: "sentinel::mitigation", "Load-shedding actions released");
        Ok(())
    }
}

#[cfg(test)]
mod mitigation_tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.76, 0)]
    #[case(0.8, 3)]
    #[case(0.85, 3)]
    #[case(0.9, 4)]
    fn test_suggestions_respect_confidence_gates(#[case] confidence: f64, #[case] expected: usize) {
        let policy = MitigationPolicy::new(RiskLevel::Medium);
        assert_eq!(policy.suggestions(confidence).len(), expected);
    }

    #[test]
    fn test_high_risk_suggestion_explains_irreversibility() {
        let suggestions = MitigationPolicy::new(RiskLevel::Medium).suggestions(0.95);
        let high = suggestions
            .iter()
            .find(|s| s.action.risk_level == RiskLevel::High)
            .unwrap();
        assert!(high.explanation.contains("cannot be undone"));
    }

    #[rstest]
    #[case(RiskLevel::Low, 2)]
    #[case(RiskLevel::Medium, 3)]
    #[case(RiskLevel::High, 3)]
    fn test_plan_respects_risk_tolerance(#[case] tolerance: RiskLevel, #[case] expected: usize) {
        let plan = MitigationPolicy::new(tolerance).stabilization_plan();
        assert_eq!(plan.len(), expected);
        assert!(plan.iter().all(|a| a.reversible && a.risk_level <= tolerance));
    }

    #[tokio::test]
    async fn test_logging_shedder_reports_each_action() {
        let plan = MitigationPolicy::new(RiskLevel::Medium).stabilization_plan();
        let outcomes = LoggingShedder.apply(&plan).await.unwrap();
        assert_eq!(outcomes.len(), plan.len());
        assert!(outcomes.iter().all(|o| o.succeeded));
    }
}

// ============================================================================
// SECTION 13: SELF TELEMETRY
// ============================================================================

/// Prometheus metrics describing the agent itself
#[derive(Clone)]
pub struct AgentTelemetry {
    registry: PrometheusRegistry,
    pub samples_total: IntCounter,
    pub degraded_readings_total: IntCounterVec,
    pub analyses_total: IntCounter,
    pub shifts_confirmed_total: IntCounter,
    pub findings_absorbed_total: IntCounter,
    pub commands_total: IntCounterVec,
    pub mode: IntGauge,
}

fn telemetry_error(e: prometheus::Error) -> SentinelError {
    SentinelError::Internal(format!("telemetry: {}", e))
}

impl AgentTelemetry {
    pub fn new() -> SentinelResult<Self> {
        let registry = PrometheusRegistry::new_custom(Some("sentinel".into()), None).map_err(telemetry_error)?;

        let samples_total =
            IntCounter::new("samples_total", "Samples appended to the window").map_err(telemetry_error)?;
        let degraded_readings_total = IntCounterVec::new(
            Opts::new("degraded_readings_total", "Adapter readings replaced by a fallback"),
            &["adapter"],
        )
        .map_err(telemetry_error)?;
        let analyses_total = IntCounter::new("analyses_total", "Analysis passes run").map_err(telemetry_error)?;
        let shifts_confirmed_total =
            IntCounter::new("shifts_confirmed_total", "Shifts that raised a warning").map_err(telemetry_error)?;
        let findings_absorbed_total = IntCounter::new(
            "findings_absorbed_total",
            "Findings ignored because a warning or stabilization was in progress",
        )
        .map_err(telemetry_error)?;
        let commands_total = IntCounterVec::new(
            Opts::new("commands_total", "Operator commands handled"),
            &["action"],
        )
        .map_err(telemetry_error)?;
        let mode = IntGauge::new(
            "mode",
            "Current mode (0 adaptive observation, 1 warning, 2 stabilization)",
        )
        .map_err(telemetry_error)?;

        registry.register(Box::new(samples_total.clone())).map_err(telemetry_error)?;
        registry
            .register(Box::new(degraded_readings_total.clone()))
            .map_err(telemetry_error)?;
        registry.register(Box::new(analyses_total.clone())).map_err(telemetry_error)?;
        registry
            .register(Box::new(shifts_confirmed_total.clone()))
            .map_err(telemetry_error)?;
        registry
            .register(Box::new(findings_absorbed_total.clone()))
            .map_err(telemetry_error)?;
        registry.register(Box::new(commands_total.clone())).map_err(telemetry_error)?;
        registry.register(Box::new(mode.clone())).map_err(telemetry_error)?;

        Ok(Self {
            registry,
            samples_total,
            degraded_readings_total,
            analyses_total,
            shifts_confirmed_total,
            findings_absorbed_total,
            commands_total,
            mode,
        })
    }

    /// Prometheus text exposition of every agent metric
    pub fn render(&self) -> SentinelResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(telemetry_error)?;
        String::from_utf8(buffer).map_err(|e| SentinelError::Internal(format!("telemetry: {}", e)))
    }
}


// ============================================================================
// SECTION 14: MODE STATE MACHINE
// ============================================================================
// Owns the operating mode. Every transition persists its mode before any
// side effect runs; a store failure aborts the transition and leaves the
// in-memory state exactly as it was.
//
//   AdaptiveObservation --shift confirmed--> Warning
//   Warning --acknowledge--> AdaptiveObservation
//   any --trigger--> Stabilization --dwell elapsed | exit--> AdaptiveObservation
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Warnings
// ----------------------------------------------------------------------------

/// Raised when at least one tracked series shifts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: Uuid,
    pub timestamp: Timestamp,
    pub shifts: Vec<ShiftFinding>,
    /// Highest probability among the shifts
    pub overall_confidence: f64,
    #[serde(default)]
    pub suggestions: Vec<MitigationSuggestion>,
}

impl Warning {
    pub fn from_findings(shifts: Vec<ShiftFinding>, policy: &MitigationPolicy) -> Self {
        let overall_confidence = shifts.iter().map(|s| s.probability).fold(0.0, f64::max);
        Self {
            id: Uuid::new_v4(),
            timestamp: Timestamp::now(),
            suggestions: policy.suggestions(overall_confidence),
            shifts,
            overall_confidence,
        }
    }

    pub fn peak_severity(&self) -> Severity {
        self.shifts
            .iter()
            .map(|s| s.severity)
            .max()
            .unwrap_or(Severity::Low)
    }

    fn notification_message(&self) -> String {
        let metrics: Vec<&str> = self.shifts.iter().map(|s| s.metric_name.as_str()).collect();
        format!(
            "Shift detected in {} with {:.0}% confidence",
            metrics.join(", "),
            self.overall_confidence * 100.0
        )
    }
}

// ----------------------------------------------------------------------------
// 14.2 Stabilization Records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StabilizationOutcome {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    DwellElapsed,
    OperatorExit,
    DataCleared,
}

/// What one stabilization asked for and how it ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilizationRecord {
    pub requested_at: Timestamp,
    pub actions: Vec<MitigationAction>,
    #[serde(default)]
    pub outcomes: Vec<ActionOutcome>,
    pub completed_at: Option<Timestamp>,
    pub outcome: StabilizationOutcome,
    pub exited_at: Option<Timestamp>,
    pub exit_reason: Option<ExitReason>,
}

impl StabilizationRecord {
    pub fn requested(actions: Vec<MitigationAction>) -> Self {
        Self {
            requested_at: Timestamp::now(),
            actions,
            outcomes: Vec::new(),
            completed_at: None,
            outcome: StabilizationOutcome::Pending,
            exited_at: None,
            exit_reason: None,
        }
    }

    fn complete(&mut self, outcomes: Vec<ActionOutcome>) {
        self.outcome = if outcomes.iter().all(|o| o.succeeded) {
            StabilizationOutcome::Completed
        } else {
            StabilizationOutcome::Failed
        };
        self.outcomes = outcomes;
        self.completed_at = Some(Timestamp::now());
    }

    fn fail(&mut self) {
        self.outcome = StabilizationOutcome::Failed;
        self.completed_at = Some(Timestamp::now());
    }

    fn exit(&mut self, reason: ExitReason) {
        self.exited_at = Some(Timestamp::now());
        self.exit_reason = Some(reason);
    }
}

#[derive(Debug, Clone)]
struct ActiveStabilization {
    deadline: TokioInstant,
    record: StabilizationRecord,
}

// ----------------------------------------------------------------------------
// 14.3 Transitions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    ShiftConfirmed,
    OperatorTrigger,
    DwellElapsed,
    OperatorExit,
    Acknowledged,
    DataCleared,
}

impl TransitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionCause::ShiftConfirmed => "shift_confirmed",
            TransitionCause::OperatorTrigger => "operator_trigger",
            TransitionCause::DwellElapsed => "dwell_elapsed",
            TransitionCause::OperatorExit => "operator_exit",
            TransitionCause::Acknowledged => "acknowledged",
            TransitionCause::DataCleared => "data_cleared",
        }
    }
}

impl From<ExitReason> for TransitionCause {
    fn from(reason: ExitReason) -> Self {
        match reason {
            ExitReason::DwellElapsed => TransitionCause::DwellElapsed,
            ExitReason::OperatorExit => TransitionCause::OperatorExit,
            ExitReason::DataCleared => TransitionCause::DataCleared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub cause: TransitionCause,
}

/// How the machine reacted to an analysis pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOutcome {
    Entered(Transition),
    /// Findings arrived while a warning or stabilization was in progress
    Absorbed,
    NoShift,
}

/// Everything the machine talks to outside its own state
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub shedder: Arc<dyn LoadShedder>,
}

// ----------------------------------------------------------------------------
// 14.4 Machine
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ModeMachine {
    mode: Mode,
    warning: Option<Warning>,
    stabilization: Option<ActiveStabilization>,
    dwell: Duration,
    action_timeout: Duration,
    policy: MitigationPolicy,
}

impl ModeMachine {
    pub fn new(config: &StabilizationConfig) -> Self {
        Self {
            mode: Mode::AdaptiveObservation,
            warning: None,
            stabilization: None,
            dwell: config.dwell,
            action_timeout: config.action_timeout,
            policy: MitigationPolicy::new(config.risk_tolerance),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn warning(&self) -> Option<&Warning> {
        self.warning.as_ref()
    }

    pub fn is_stabilizing(&self) -> bool {
        self.mode == Mode::Stabilization
    }

    /// When the timed return from stabilization fires
    pub fn deadline(&self) -> Option<TokioInstant> {
        self.stabilization.as_ref().map(|s| s.deadline)
    }

    pub fn stabilization_record(&self) -> Option<&StabilizationRecord> {
        self.stabilization.as_ref().map(|s| &s.record)
    }

    /// Push the timed return back, used when the return itself failed
    pub fn postpone_deadline(&mut self, delay: Duration) {
        if let Some(active) = self.stabilization.as_mut() {
            active.deadline = TokioInstant::now() + delay;
        }
    }

    fn enter(&mut self, to: Mode, cause: TransitionCause) -> Transition {
        let transition = Transition {
            from: self.mode,
            to,
            cause,
        };
        self.mode = to;
        log_transition!(transition.from, transition.to, cause.as_str());
        transition
    }

    /// React to the findings of one analysis pass
    pub async fn on_findings(&mut self, deps: &Collaborators, findings: Vec<ShiftFinding>) -> SentinelResult<ShiftOutcome> {
        if findings.is_empty() {
            return Ok(ShiftOutcome::NoShift);
        }

        if self.mode != Mode::AdaptiveObservation {
            debug!(
                target: "sentinel::mode",
                mode = %self.mode,
                findings = findings.len(),
                "Findings absorbed"
            );
            return Ok(ShiftOutcome::Absorbed);
        }

        let warning = Warning::from_findings(findings, &self.policy);
        let store = deps.store.as_ref();

        put_json(store, StoreKey::CurrentWarning, &warning).await?;
        if let Err(e) = put_json(store, StoreKey::CurrentMode, &Mode::Warning).await {
            if let Err(cleanup) = store.remove(StoreKey::CurrentWarning).await {
                warn!(target: "sentinel::mode", error = %cleanup, "Could not roll back stored warning");
            }
            return Err(e.into());
        }

        let transition = self.enter(Mode::Warning, TransitionCause::ShiftConfirmed);
        let severity = warning.peak_severity();
        let message = warning.notification_message();
        self.warning = Some(warning);

        if let Err(e) = deps.notifier.notify("Regime shift detected", &message, severity).await {
            warn!(target: "sentinel::mode", error = %e, "Warning notification failed");
        }

        Ok(ShiftOutcome::Entered(transition))
    }

    /// Enter stabilization. Returns `None` when already stabilizing; the
    /// running plan and its deadline are left alone.
    pub async fn trigger_stabilization(&mut self, deps: &Collaborators) -> SentinelResult<Option<Transition>> {
        if self.mode == Mode::Stabilization {
            debug!(target: "sentinel::mode", "Stabilization already active");
            return Ok(None);
        }

        let store = deps.store.as_ref();
        let previous = self.mode;

        put_json(store, StoreKey::CurrentMode, &Mode::Stabilization).await?;
        if let Err(e) = put_json(store, StoreKey::StabilizationActive, &true).await {
            if let Err(rollback) = put_json(store, StoreKey::CurrentMode, &previous).await {
                warn!(target: "sentinel::mode", error = %rollback, "Could not roll back stored mode");
            }
            return Err(e.into());
        }

        let transition = self.enter(Mode::Stabilization, TransitionCause::OperatorTrigger);

        let plan = self.policy.stabilization_plan();
        let mut record = StabilizationRecord::requested(plan.clone());
        let deadline = TokioInstant::now() + self.dwell;

        match timeout(self.action_timeout, deps.shedder.apply(&plan)).await {
            Ok(Ok(outcomes)) => record.complete(outcomes),
            Ok(Err(e)) => {
                warn!(target: "sentinel::mitigation", error = %e, "Load-shedding plan failed");
                record.fail();
            }
            Err(_) => {
                warn!(
                    target: "sentinel::mitigation",
                    timeout_ms = self.action_timeout.as_millis() as u64,
                    "Load-shedding plan timed out"
                );
                record.fail();
            }
        }

        if let Err(e) = put_json(store, StoreKey::LastStabilization, &record).await {
            warn!(target: "sentinel::mode", error = %e, "Could not persist stabilization record");
        }

        info!(
            target: "sentinel::mode",
            actions = record.actions.len(),
            outcome = ?record.outcome,
            dwell_secs = self.dwell.as_secs(),
            "Stabilization started"
        );

        self.stabilization = Some(ActiveStabilization { deadline, record });
        Ok(Some(transition))
    }

    /// Leave stabilization for adaptive observation
    pub async fn exit_stabilization(&mut self, deps: &Collaborators, reason: ExitReason) -> SentinelResult<Transition> {
        if self.mode != Mode::Stabilization {
            return Err(CommandError::InvalidState {
                action: "exitStabilization".into(),
                mode: self.mode,
            }
            .into());
        }

        let store = deps.store.as_ref();
        put_json(store, StoreKey::CurrentMode, &Mode::AdaptiveObservation).await?;
        if let Err(e) = put_json(store, StoreKey::StabilizationActive, &false).await {
            if let Err(rollback) = put_json(store, StoreKey::CurrentMode, &Mode::Stabilization).await {
                warn!(target: "sentinel::mode", error = %rollback, "Could not roll back stored mode");
            }
            return Err(e.into());
        }

        let transition = self.enter(Mode::AdaptiveObservation, reason.into());

        // A warning that led into stabilization is answered by it
        if self.warning.take().is_some() {
            if let Err(e) = store.remove(StoreKey::CurrentWarning).await {
                warn!(target: "sentinel::mode", error = %e, "Could not remove answered warning");
            }
        }

        if let Some(mut active) = self.stabilization.take() {
            active.record.exit(reason);
            if let Err(e) = put_json(store, StoreKey::LastStabilization, &active.record).await {
                warn!(target: "sentinel::mode", error = %e, "Could not persist stabilization record");
            }
        }

        self.release_shedder(deps).await;
        Ok(transition)
    }

    async fn release_shedder(&self, deps: &Collaborators) {
        match timeout(self.action_timeout, deps.shedder.restore()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "sentinel::mitigation", error = %e, "Load-shedding restore failed"),
            Err(_) => warn!(target: "sentinel::mitigation", "Load-shedding restore timed out"),
        }
    }

    /// Drop the stored warning; leaves Warning for adaptive observation
    pub async fn acknowledge(&mut self, deps: &Collaborators) -> SentinelResult<Option<Transition>> {
        let store = deps.store.as_ref();
        store.remove(StoreKey::CurrentWarning).await?;

        if self.mode != Mode::Warning {
            self.warning = None;
            return Ok(None);
        }

        if let Err(e) = put_json(store, StoreKey::CurrentMode, &Mode::AdaptiveObservation).await {
            if let Some(warning) = &self.warning {
                if let Err(rollback) = put_json(store, StoreKey::CurrentWarning, warning).await {
                    warn!(target: "sentinel::mode", error = %rollback, "Could not restore stored warning");
                }
            }
            return Err(e.into());
        }

        self.warning = None;
        Ok(Some(self.enter(Mode::AdaptiveObservation, TransitionCause::Acknowledged)))
    }

    /// Wipe persisted state and return to adaptive observation
    pub async fn reset(&mut self, deps: &Collaborators) -> SentinelResult<()> {
        deps.store.clear().await?;

        let was_stabilizing = self.stabilization.take().is_some();
        self.warning = None;
        if self.mode != Mode::AdaptiveObservation {
            self.enter(Mode::AdaptiveObservation, TransitionCause::DataCleared);
        }
        if was_stabilizing {
            self.release_shedder(deps).await;
        }
        Ok(())
    }

    /// Reload mode and warning from the store at startup
    pub async fn restore(&mut self, deps: &Collaborators) -> SentinelResult<()> {
        let store = deps.store.as_ref();
        let mode: Mode = fetch_json(store, StoreKey::CurrentMode).await?.unwrap_or_default();
        let warning: Option<Warning> = fetch_json(store, StoreKey::CurrentWarning).await?;

        self.mode = match mode {
            Mode::Warning if warning.is_none() => {
                warn!(target: "sentinel::mode", "Stored mode is warning but no warning was stored");
                Mode::AdaptiveObservation
            }
            Mode::Stabilization => {
                let record = match fetch_json::<StabilizationRecord>(store, StoreKey::LastStabilization).await {
                    Ok(Some(record)) => record,
                    Ok(None) => StabilizationRecord::requested(Vec::new()),
                    Err(e) => {
                        warn!(target: "sentinel::mode", error = %e, "Stored stabilization record unreadable");
                        StabilizationRecord::requested(Vec::new())
                    }
                };
                self.stabilization = Some(ActiveStabilization {
                    deadline: TokioInstant::now() + self.dwell,
                    record,
                });
                Mode::Stabilization
            }
            other => other,
        };
        self.warning = warning;

        info!(
            target: "sentinel::mode",
            mode = %self.mode,
            has_warning = self.warning.is_some(),
            "Mode restored"
        );
        Ok(())
    }
}


#[cfg(test)]
mod mode_tests {
    use super::mode_test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn machine() -> ModeMachine {
        ModeMachine::new(&StabilizationConfig::default())
    }

    #[tokio::test]
    async fn test_shift_enters_warning_and_notifies() {
        let h = harness();
        let mut rx = h.alerts.subscribe();
        let mut m = machine();

        let outcome = m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.unwrap();
        assert!(matches!(outcome, ShiftOutcome::Entered(t) if t.to == Mode::Warning));
        assert_eq!(m.mode(), Mode::Warning);

        let stored: Option<Warning> = fetch_json(h.store.as_ref(), StoreKey::CurrentWarning).await.unwrap();
        assert_eq!(stored.as_ref(), m.warning());
        let mode: Option<Mode> = fetch_json(h.store.as_ref(), StoreKey::CurrentMode).await.unwrap();
        assert_eq!(mode, Some(Mode::Warning));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.severity, Severity::Critical);
        assert!(alert.message.contains("90%"));
    }

    #[tokio::test]
    async fn test_no_findings_is_no_shift() {
        let h = harness();
        let mut m = machine();
        assert_eq!(m.on_findings(&h.deps, Vec::new()).await.unwrap(), ShiftOutcome::NoShift);
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
    }

    #[tokio::test]
    async fn test_findings_absorbed_outside_observation() {
        let h = harness();
        let mut m = machine();
        m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.unwrap();
        let first_id = m.warning().unwrap().id;

        let outcome = m.on_findings(&h.deps, vec![memory_finding(0.95)]).await.unwrap();
        assert_eq!(outcome, ShiftOutcome::Absorbed);
        assert_eq!(m.warning().unwrap().id, first_id);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_mode_unchanged() {
        let h = harness();
        let mut m = machine();
        h.store.failing.store(true, AtomicOrdering::SeqCst);

        assert!(m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.is_err());
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
        assert!(m.warning().is_none());

        assert!(m.trigger_stabilization(&h.deps).await.is_err());
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
        assert_eq!(h.shedder.applied.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_keeps_warning() {
        let h = harness();
        let mut m = machine();
        m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.unwrap();

        h.store.failing.store(true, AtomicOrdering::SeqCst);
        assert!(m.acknowledge(&h.deps).await.is_err());
        assert_eq!(m.mode(), Mode::Warning);
        assert!(m.warning().is_some());

        h.store.failing.store(false, AtomicOrdering::SeqCst);
        let transition = m.acknowledge(&h.deps).await.unwrap().unwrap();
        assert_eq!(transition.cause, TransitionCause::Acknowledged);
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
        assert_eq!(h.store.get(StoreKey::CurrentWarning).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_is_idempotent() {
        let h = harness();
        let mut m = machine();

        assert!(m.trigger_stabilization(&h.deps).await.unwrap().is_some());
        let deadline = m.deadline().unwrap();
        assert_eq!(m.stabilization_record().unwrap().outcome, StabilizationOutcome::Completed);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(m.trigger_stabilization(&h.deps).await.unwrap().is_none());
        assert_eq!(m.deadline(), Some(deadline));
        assert_eq!(h.shedder.applied.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exit_stabilization() {
        let h = harness();
        let mut m = machine();

        let err = m.exit_stabilization(&h.deps, ExitReason::OperatorExit).await.unwrap_err();
        assert!(matches!(err, SentinelError::Command(CommandError::InvalidState { .. })));

        m.trigger_stabilization(&h.deps).await.unwrap();
        let transition = m.exit_stabilization(&h.deps, ExitReason::OperatorExit).await.unwrap();
        assert_eq!(transition.cause, TransitionCause::OperatorExit);
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
        assert!(m.deadline().is_none());
        assert_eq!(h.shedder.restored.load(AtomicOrdering::SeqCst), 1);

        let active: Option<bool> = fetch_json(h.store.as_ref(), StoreKey::StabilizationActive).await.unwrap();
        assert_eq!(active, Some(false));
        let record: StabilizationRecord = fetch_json(h.store.as_ref(), StoreKey::LastStabilization)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.exit_reason, Some(ExitReason::OperatorExit));
    }

    #[tokio::test]
    async fn test_exit_clears_warning_that_led_to_stabilization() {
        let h = harness();
        let mut m = machine();
        m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.unwrap();
        m.trigger_stabilization(&h.deps).await.unwrap();
        assert!(m.warning().is_some());

        m.exit_stabilization(&h.deps, ExitReason::DwellElapsed).await.unwrap();
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
        assert!(m.warning().is_none());
        assert_eq!(h.store.get(StoreKey::CurrentWarning).await.unwrap(), None);

        let mut restored = machine();
        restored.restore(&h.deps).await.unwrap();
        assert_eq!(restored.mode(), Mode::AdaptiveObservation);
        assert!(restored.warning().is_none());
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let h = harness();
        let mut m = machine();
        m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.unwrap();

        let mut restored = machine();
        restored.restore(&h.deps).await.unwrap();
        assert_eq!(restored.mode(), Mode::Warning);
        assert_eq!(restored.warning(), m.warning());
    }

    #[tokio::test]
    async fn test_restore_warning_mode_without_warning_falls_back() {
        let h = harness();
        put_json(h.store.as_ref(), StoreKey::CurrentMode, &Mode::Warning).await.unwrap();

        let mut m = machine();
        m.restore(&h.deps).await.unwrap();
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
    }

    #[tokio::test]
    async fn test_restored_stabilization_gets_fresh_dwell() {
        let h = harness();
        put_json(h.store.as_ref(), StoreKey::CurrentMode, &Mode::Stabilization).await.unwrap();

        let mut m = machine();
        let before = TokioInstant::now();
        m.restore(&h.deps).await.unwrap();
        assert!(m.is_stabilizing());
        assert!(m.deadline().unwrap() >= before + StabilizationConfig::default().dwell);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let h = harness();
        let mut m = machine();
        m.on_findings(&h.deps, vec![memory_finding(0.9)]).await.unwrap();
        m.trigger_stabilization(&h.deps).await.unwrap();

        m.reset(&h.deps).await.unwrap();
        assert_eq!(m.mode(), Mode::AdaptiveObservation);
        assert!(m.warning().is_none());
        assert!(m.deadline().is_none());
        for key in StoreKey::ALL {
            assert_eq!(h.store.get(key).await.unwrap(), None);
        }
    }

    #[test]
    fn test_warning_suggestions_follow_confidence() {
        let policy = MitigationPolicy::new(RiskLevel::Medium);
        let warning = Warning::from_findings(vec![memory_finding(0.85), memory_finding(0.7)], &policy);
        assert_eq!(warning.overall_confidence, 0.85);
        assert!(warning.suggestions.iter().all(|s| s.action.risk_level != RiskLevel::High));
        assert!(!warning.suggestions.is_empty());
    }
}

// ============================================================================
// SECTION 15: AGENT CONTEXT & COMMAND API
// ============================================================================
// `AgentContext` is the single owner of window, settings and mode. The actor
// loop drives it from timers and operator commands; nothing else mutates it.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Requests & Responses
// ----------------------------------------------------------------------------

/// An operator request: `{"action": "...", "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl CommandRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            payload: None,
        }
    }

    pub fn with_payload(action: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            action: action.into(),
            payload: Some(payload),
        }
    }
}

/// Either the result object or `{"error": "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Error { error: String },
    Success(JsonValue),
}

impl CommandResponse {
    pub fn ok(value: JsonValue) -> Self {
        CommandResponse::Success(value)
    }

    pub fn error(message: impl Into<String>) -> Self {
        CommandResponse::Error { error: message.into() }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CommandResponse::Error { .. })
    }

    /// A top-level field of a successful response
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        match self {
            CommandResponse::Success(value) => value.get(name),
            CommandResponse::Error { .. } => None,
        }
    }

    pub fn into_json(self) -> JsonValue {
        match self {
            CommandResponse::Success(value) => value,
            CommandResponse::Error { error } => json!({ "error": error }),
        }
    }
}

// ----------------------------------------------------------------------------
// 15.2 Commands
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetMetrics,
    GetStatus,
    TriggerStabilization,
    ExitStabilization,
    AcknowledgeWarning,
    GetSettings,
    UpdateSettings(JsonValue),
    TestWarning,
    ClearData,
    GetWarning,
    GetAnalysis,
    GetTelemetry,
}

impl Command {
    pub fn parse(request: &CommandRequest) -> Result<Self, CommandError> {
        let command = match request.action.as_str() {
            "getMetrics" => Command::GetMetrics,
            "getStatus" => Command::GetStatus,
            "triggerStabilization" => Command::TriggerStabilization,
            "exitStabilization" => Command::ExitStabilization,
            "acknowledgeWarning" => Command::AcknowledgeWarning,
            "getSettings" => Command::GetSettings,
            "updateSettings" => match &request.payload {
                Some(payload) => Command::UpdateSettings(payload.clone()),
                None => return Err(CommandError::invalid_payload("updateSettings", "missing payload")),
            },
            "testWarning" => Command::TestWarning,
            "clearData" => Command::ClearData,
            "getWarning" => Command::GetWarning,
            "getAnalysis" => Command::GetAnalysis,
            "getTelemetry" => Command::GetTelemetry,
            other => {
                return Err(CommandError::UnknownAction {
                    action: other.to_string(),
                })
            }
        };
        Ok(command)
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::GetMetrics => "getMetrics",
            Command::GetStatus => "getStatus",
            Command::TriggerStabilization => "triggerStabilization",
            Command::ExitStabilization => "exitStabilization",
            Command::AcknowledgeWarning => "acknowledgeWarning",
            Command::GetSettings => "getSettings",
            Command::UpdateSettings(_) => "updateSettings",
            Command::TestWarning => "testWarning",
            Command::ClearData => "clearData",
            Command::GetWarning => "getWarning",
            Command::GetAnalysis => "getAnalysis",
            Command::GetTelemetry => "getTelemetry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub mode: Mode,
    pub stabilization_active: bool,
    pub sample_count: usize,
    pub initialized: bool,
    pub monitoring_enabled: bool,
    pub has_warning: bool,
}

// ----------------------------------------------------------------------------
// 15.3 Agent Context
// ----------------------------------------------------------------------------

pub struct AgentContext {
    settings: Settings,
    window: MetricWindow,
    sampler: Sampler,
    analyzer: RegimeAnalyzer,
    machine: ModeMachine,
    deps: Collaborators,
    telemetry: AgentTelemetry,
    last_report: Option<AnalysisReport>,
    initialized: bool,
}

impl AgentContext {
    pub fn new(config: &AgentConfig, adapters: Arc<dyn MetricAdapters>, deps: Collaborators) -> SentinelResult<Self> {
        Ok(Self {
            settings: config.defaults,
            window: MetricWindow::with_capacity(config.defaults.window_size),
            sampler: Sampler::new(adapters, config.sampling.adapter_timeout),
            analyzer: RegimeAnalyzer::new(&config.analysis),
            machine: ModeMachine::new(&config.stabilization),
            deps,
            telemetry: AgentTelemetry::new()?,
            last_report: None,
            initialized: false,
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn mode(&self) -> Mode {
        self.machine.mode()
    }

    pub fn window(&self) -> &MetricWindow {
        &self.window
    }

    pub fn telemetry(&self) -> &AgentTelemetry {
        &self.telemetry
    }

    pub fn stabilization_deadline(&self) -> Option<TokioInstant> {
        self.machine.deadline()
    }

    /// Restore persisted settings and mode. Unreadable state is logged and
    /// the configured defaults stay in effect.
    pub async fn initialize(&mut self) {
        match fetch_json::<Settings>(self.deps.store.as_ref(), StoreKey::Settings).await {
            Ok(Some(stored)) => match stored.validate() {
                Ok(()) => self.settings = stored,
                Err(e) => warn!(target: "sentinel::agent", error = %e, "Stored settings out of range, using defaults"),
            },
            Ok(None) => {}
            Err(e) => warn!(target: "sentinel::agent", error = %e, "Could not restore settings"),
        }

        if let Err(e) = self.machine.restore(&self.deps).await {
            warn!(target: "sentinel::agent", error = %e, "Could not restore mode, starting in adaptive observation");
        }

        self.telemetry.mode.set(self.machine.mode().gauge_value());
        self.initialized = true;

        info!(
            target: "sentinel::agent",
            mode = %self.machine.mode(),
            window_size = self.settings.window_size,
            confidence_threshold = self.settings.confidence_threshold,
            monitoring_enabled = self.settings.monitoring_enabled,
            "Agent initialized"
        );
    }

    /// Collect one sample and append it to the window
    pub async fn sample_tick(&mut self) {
        if !self.settings.monitoring_enabled {
            return;
        }

        let timer = PerfTimer::with_threshold("sample_tick", TICK_WARN_THRESHOLD_MS);
        let sample = self.sampler.sample().await;

        for adapter in &sample.degraded {
            self.telemetry
                .degraded_readings_total
                .with_label_values(&[adapter.as_str()])
                .inc();
        }

        if let Err(e) = put_json(self.deps.store.as_ref(), StoreKey::LatestSample, &sample).await {
            warn!(target: "sentinel::sampler", error = %e, "Could not publish latest sample");
        }

        let evicted = self.window.push(sample, self.settings.window_size);
        self.telemetry.samples_total.inc();

        trace!(
            target: "sentinel::sampler",
            window = self.window.len(),
            evicted,
            "Sample appended"
        );
        timer.stop();
    }

    /// Run the analyzer over a snapshot of the window
    pub async fn analysis_tick(&mut self) -> SentinelResult<ShiftOutcome> {
        if !self.settings.monitoring_enabled {
            return Ok(ShiftOutcome::NoShift);
        }

        let timer = PerfTimer::with_threshold("analysis_tick", TICK_WARN_THRESHOLD_MS);
        let snapshot = self.window.snapshot();
        let report = match self.analyzer.analyze(&snapshot, self.settings.confidence_threshold) {
            Some(report) => report,
            None => {
                trace!(target: "sentinel::analyzer", samples = snapshot.len(), "Not enough samples to analyze");
                return Ok(ShiftOutcome::NoShift);
            }
        };

        self.telemetry.analyses_total.inc();
        let findings = report.findings.clone();
        self.last_report = Some(report);

        let outcome = self.apply_findings(findings).await;
        timer.stop();
        outcome
    }

    async fn apply_findings(&mut self, findings: Vec<ShiftFinding>) -> SentinelResult<ShiftOutcome> {
        let outcome = self.machine.on_findings(&self.deps, findings).await?;
        match outcome {
            ShiftOutcome::Entered(_) => self.telemetry.shifts_confirmed_total.inc(),
            ShiftOutcome::Absorbed => self.telemetry.findings_absorbed_total.inc(),
            ShiftOutcome::NoShift => {}
        }
        self.telemetry.mode.set(self.machine.mode().gauge_value());
        Ok(outcome)
    }

    /// The dwell deadline fired
    pub async fn stabilization_elapsed(&mut self) {
        if let Err(e) = self.machine.exit_stabilization(&self.deps, ExitReason::DwellElapsed).await {
            warn!(
                target: "sentinel::mode",
                error = %e,
                retry_secs = DWELL_RETRY_DELAY_SECS,
                "Timed return from stabilization failed"
            );
            self.machine
                .postpone_deadline(Duration::from_secs(DWELL_RETRY_DELAY_SECS));
        }
        self.telemetry.mode.set(self.machine.mode().gauge_value());
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            mode: self.machine.mode(),
            stabilization_active: self.machine.is_stabilizing(),
            sample_count: self.window.len(),
            initialized: self.initialized,
            monitoring_enabled: self.settings.monitoring_enabled,
            has_warning: self.machine.warning().is_some(),
        }
    }

    /// Answer one operator request
    pub async fn handle(&mut self, request: CommandRequest) -> CommandResponse {
        let command = match Command::parse(&request) {
            Ok(command) => command,
            Err(e) => {
                debug!(target: "sentinel::commands", action = %request.action, error = %e, "Rejected request");
                return CommandResponse::error(e.to_string());
            }
        };

        let action = command.action();
        self.telemetry.commands_total.with_label_values(&[action]).inc();

        match self.execute(command).await {
            Ok(value) => {
                debug!(target: "sentinel::commands", action, "Command handled");
                CommandResponse::ok(value)
            }
            Err(e) => {
                warn!(
                    target: "sentinel::commands",
                    action,
                    error = %e,
                    category = e.category(),
                    "Command failed"
                );
                CommandResponse::error(e.to_string())
            }
        }
    }

    async fn execute(&mut self, command: Command) -> SentinelResult<JsonValue> {
        let value = match command {
            Command::GetMetrics => json!({ "metrics": self.window.snapshot() }),
            Command::GetStatus => serde_json::to_value(self.status())?,
            Command::TriggerStabilization => {
                self.machine.trigger_stabilization(&self.deps).await?;
                self.telemetry.mode.set(self.machine.mode().gauge_value());
                self.mode_response()
            }
            Command::ExitStabilization => {
                self.machine
                    .exit_stabilization(&self.deps, ExitReason::OperatorExit)
                    .await?;
                self.telemetry.mode.set(self.machine.mode().gauge_value());
                self.mode_response()
            }
            Command::AcknowledgeWarning => {
                self.machine.acknowledge(&self.deps).await?;
                self.telemetry.mode.set(self.machine.mode().gauge_value());
                self.mode_response()
            }
            Command::GetSettings => serde_json::to_value(self.settings)?,
            Command::UpdateSettings(patch) => self.update_settings(&patch).await?,
            Command::TestWarning => {
                let finding = ShiftFinding::synthetic(self.window.len());
                self.apply_findings(vec![finding]).await?;
                self.mode_response()
            }
            Command::ClearData => {
                self.machine.reset(&self.deps).await?;
                self.window.clear();
                self.sampler.reset();
                self.last_report = None;
                self.telemetry.mode.set(self.machine.mode().gauge_value());
                info!(target: "sentinel::agent", "Data cleared");
                json!({ "success": true })
            }
            Command::GetWarning => json!({ "warning": self.machine.warning() }),
            Command::GetAnalysis => json!({ "report": self.last_report }),
            Command::GetTelemetry => json!({ "telemetry": self.telemetry.render()? }),
        };
        Ok(value)
    }

    fn mode_response(&self) -> JsonValue {
        json!({ "success": true, "mode": self.machine.mode() })
    }

    async fn update_settings(&mut self, patch: &JsonValue) -> SentinelResult<JsonValue> {
        let update = self.settings.merge_patch(patch)?;

        if update.changed() {
            put_json(self.deps.store.as_ref(), StoreKey::Settings, &update.settings).await?;
            self.settings = update.settings;
            // The window never outgrows the live size, ticking or not
            let evicted = self.window.truncate_to(self.settings.window_size);
            info!(
                target: "sentinel::agent",
                applied = ?update.applied,
                rejected = update.rejected.len(),
                evicted,
                "Settings updated"
            );
        }

        Ok(json!({
            "success": update.is_clean(),
            "settings": self.settings,
            "applied": update.applied,
            "rejected": update.rejected,
        }))
    }
}

#[cfg(test)]
mod context_tests {
    use super::mode_test_support::*;
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn context() -> (AgentContext, Harness, Arc<ScriptedAdapters>) {
        let h = harness();
        let adapters = ScriptedAdapters::steady(40.0, 20.0);
        let ctx = AgentContext::new(&AgentConfig::default(), adapters.clone(), h.deps.clone()).unwrap();
        (ctx, h, adapters)
    }

    async fn send(ctx: &mut AgentContext, action: &str) -> CommandResponse {
        ctx.handle(CommandRequest::new(action)).await
    }

    #[tokio::test]
    async fn test_status_of_fresh_agent() {
        let (mut ctx, _h, _) = context();
        ctx.initialize().await;

        let status: StatusReport = serde_json::from_value(send(&mut ctx, "getStatus").await.into_json()).unwrap();
        assert_eq!(
            status,
            StatusReport {
                mode: Mode::AdaptiveObservation,
                stabilization_active: false,
                sample_count: 0,
                initialized: true,
                monitoring_enabled: true,
                has_warning: false,
            }
        );
    }

    #[tokio::test]
    async fn test_sampling_fills_window_and_store() {
        let (mut ctx, h, adapters) = context();
        for _ in 0..3 {
            ctx.sample_tick().await;
        }
        assert_eq!(ctx.window().len(), 3);
        let latest: Option<MetricSample> = fetch_json(h.store.as_ref(), StoreKey::LatestSample).await.unwrap();
        assert_eq!(latest.unwrap().memory.usage_percent, 40.0);

        adapters.fail(AdapterKind::Memory);
        adapters.set_memory(90.0);
        ctx.sample_tick().await;
        let last = ctx.window().latest().unwrap();
        assert_eq!(last.memory.usage_percent, 40.0);
        assert_eq!(last.degraded.as_slice(), &[AdapterKind::Memory]);
    }

    #[tokio::test]
    async fn test_window_respects_settings() {
        let (mut ctx, _h, _) = context();
        for _ in 0..60 {
            ctx.sample_tick().await;
        }
        assert_eq!(ctx.window().len(), DEFAULT_WINDOW_SIZE);

        let response = ctx
            .handle(CommandRequest::with_payload("updateSettings", json!({ "windowSize": 20 })))
            .await;
        assert_eq!(response.field("success"), Some(&json!(true)));
        ctx.sample_tick().await;
        assert_eq!(ctx.window().len(), 20);
    }

    #[tokio::test]
    async fn test_shrinking_window_while_paused_trims_immediately() {
        let (mut ctx, _h, _) = context();
        for _ in 0..50 {
            ctx.sample_tick().await;
        }

        let response = ctx
            .handle(CommandRequest::with_payload(
                "updateSettings",
                json!({ "monitoringEnabled": false, "windowSize": 10 }),
            ))
            .await;
        assert_eq!(response.field("success"), Some(&json!(true)));
        assert_eq!(ctx.window().len(), 10);

        for _ in 0..20 {
            ctx.sample_tick().await;
        }
        let status = ctx.status();
        assert_eq!(status.sample_count, 10);
        assert!(!status.monitoring_enabled);
        let metrics = send(&mut ctx, "getMetrics").await;
        assert_eq!(metrics.field("metrics").unwrap().as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_disabled_monitoring_skips_ticks() {
        let (mut ctx, _h, _) = context();
        ctx.handle(CommandRequest::with_payload(
            "updateSettings",
            json!({ "monitoringEnabled": false }),
        ))
        .await;
        ctx.sample_tick().await;
        assert_eq!(ctx.window().len(), 0);
        assert_eq!(ctx.analysis_tick().await.unwrap(), ShiftOutcome::NoShift);
    }

    #[tokio::test]
    async fn test_analysis_detects_memory_shift() {
        let (mut ctx, h, adapters) = context();
        let mut rx = h.alerts.subscribe();

        adapters.set_memory(20.0);
        for _ in 0..20 {
            ctx.sample_tick().await;
        }
        adapters.set_memory(80.0);
        for _ in 0..20 {
            ctx.sample_tick().await;
        }

        let outcome = ctx.analysis_tick().await.unwrap();
        assert!(matches!(outcome, ShiftOutcome::Entered(_)));
        assert_eq!(ctx.mode(), Mode::Warning);
        assert_eq!(rx.recv().await.unwrap().title, "Regime shift detected");

        let report = send(&mut ctx, "getAnalysis").await;
        assert_eq!(report.field("report").unwrap()["findings"][0]["changePointIndex"], json!(20));
    }

    #[tokio::test]
    async fn test_test_warning_then_acknowledge() {
        let (mut ctx, h, _) = context();
        let mut rx = h.alerts.subscribe();

        let response = send(&mut ctx, "testWarning").await;
        assert_eq!(response.field("mode"), Some(&json!("warning")));
        assert!(rx.recv().await.is_ok());

        let warning = send(&mut ctx, "getWarning").await;
        assert_eq!(warning.field("warning").unwrap()["overallConfidence"], json!(0.85));
        assert!(h.store.get(StoreKey::CurrentWarning).await.unwrap().is_some());

        let response = send(&mut ctx, "acknowledgeWarning").await;
        assert_eq!(response.field("mode"), Some(&json!("adaptiveObservation")));
        assert_eq!(send(&mut ctx, "getWarning").await.field("warning"), Some(&JsonValue::Null));
        assert!(h.store.get(StoreKey::CurrentWarning).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_store_failure_is_an_error() {
        let (mut ctx, h, _) = context();
        send(&mut ctx, "testWarning").await;

        h.store.failing.store(true, AtomicOrdering::SeqCst);
        let response = send(&mut ctx, "acknowledgeWarning").await;
        assert!(response.is_error());
        assert_eq!(ctx.status().mode, Mode::Warning);
    }

    #[tokio::test]
    async fn test_unknown_action_changes_nothing() {
        let (mut ctx, _h, _) = context();
        ctx.sample_tick().await;
        let before = ctx.status();

        let response = send(&mut ctx, "selfDestruct").await;
        assert_eq!(response, CommandResponse::error("Unknown action: selfDestruct"));
        assert_eq!(ctx.status(), before);
    }

    #[tokio::test]
    async fn test_exit_without_stabilization_is_an_error() {
        let (mut ctx, _h, _) = context();
        let response = send(&mut ctx, "exitStabilization").await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_stabilization_round_trip() {
        let (mut ctx, h, _) = context();

        let response = send(&mut ctx, "triggerStabilization").await;
        assert_eq!(response.field("mode"), Some(&json!("stabilization")));
        assert!(ctx.stabilization_deadline().is_some());
        assert!(ctx.status().stabilization_active);

        let response = send(&mut ctx, "exitStabilization").await;
        assert_eq!(response.field("mode"), Some(&json!("adaptiveObservation")));
        assert!(ctx.stabilization_deadline().is_none());
        assert_eq!(h.shedder.restored.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_settings_rejects_bad_fields() {
        let (mut ctx, h, _) = context();
        let response = ctx
            .handle(CommandRequest::with_payload(
                "updateSettings",
                json!({ "confidenceThreshold": 0.99, "windowSize": 120 }),
            ))
            .await;

        assert_eq!(response.field("success"), Some(&json!(false)));
        assert_eq!(response.field("rejected").unwrap()[0]["field"], json!("confidenceThreshold"));
        assert_eq!(ctx.settings().window_size, 120);
        assert_eq!(ctx.settings().confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);

        let stored: Option<Settings> = fetch_json(h.store.as_ref(), StoreKey::Settings).await.unwrap();
        assert_eq!(stored.unwrap().window_size, 120);

        assert!(ctx
            .handle(CommandRequest::with_payload("updateSettings", json!([1, 2])))
            .await
            .is_error());
        assert!(send(&mut ctx, "updateSettings").await.is_error());
    }

    #[tokio::test]
    async fn test_clear_data_resets_everything_but_settings() {
        let (mut ctx, h, _) = context();
        ctx.handle(CommandRequest::with_payload("updateSettings", json!({ "windowSize": 30 })))
            .await;
        for _ in 0..5 {
            ctx.sample_tick().await;
        }
        send(&mut ctx, "testWarning").await;

        let response = send(&mut ctx, "clearData").await;
        assert_eq!(response.field("success"), Some(&json!(true)));

        let status = ctx.status();
        assert_eq!(status.sample_count, 0);
        assert_eq!(status.mode, Mode::AdaptiveObservation);
        assert!(!status.has_warning);
        assert_eq!(ctx.settings().window_size, 30);
        for key in StoreKey::ALL {
            assert_eq!(h.store.get(key).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_initialize_restores_state() {
        let (mut ctx, h, _) = context();
        ctx.handle(CommandRequest::with_payload("updateSettings", json!({ "confidenceThreshold": 0.9 })))
            .await;
        send(&mut ctx, "testWarning").await;

        let mut restored = AgentContext::new(
            &AgentConfig::default(),
            ScriptedAdapters::steady(40.0, 20.0),
            h.deps.clone(),
        )
        .unwrap();
        restored.initialize().await;
        assert_eq!(restored.settings().confidence_threshold, 0.9);
        assert_eq!(restored.mode(), Mode::Warning);
        assert!(restored.status().has_warning);
    }

    #[tokio::test]
    async fn test_telemetry_counts_commands() {
        let (mut ctx, _h, _) = context();
        send(&mut ctx, "getStatus").await;
        ctx.sample_tick().await;

        let response = send(&mut ctx, "getTelemetry").await;
        let text = response.field("telemetry").unwrap().as_str().unwrap().to_string();
        assert!(text.contains("sentinel_commands_total{action=\"getStatus\"} 1"));
        assert!(text.contains("sentinel_samples_total 1"));
    }

    #[test]
    fn test_response_json_shape() {
        let response: CommandResponse = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert!(response.is_error());
        let response: CommandResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(response.field("success"), Some(&json!(true)));
    }
}

// ============================================================================
// SECTION 16: AGENT RUNTIME
// ============================================================================
// One actor task owns the `AgentContext` and multiplexes:
// - shutdown token
// - stabilization deadline (only armed while stabilizing)
// - sample and analysis intervals (missed ticks are skipped)
// - operator commands (mpsc in, oneshot out)
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct CommandEnvelope {
    pub request: CommandRequest,
    pub reply: oneshot::Sender<CommandResponse>,
}

/// Cloneable entry point to a running agent
#[derive(Debug, Clone)]
pub struct AgentHandle {
    sender: mpsc::Sender<CommandEnvelope>,
}

impl AgentHandle {
    /// Send a request and wait for its single response
    pub async fn call(&self, request: CommandRequest) -> Result<CommandResponse, CommandError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CommandEnvelope { request, reply })
            .await
            .map_err(|_| CommandError::AgentUnavailable)?;
        response.await.map_err(|_| CommandError::AgentUnavailable)
    }

    pub async fn send(&self, action: &str) -> Result<CommandResponse, CommandError> {
        self.call(CommandRequest::new(action)).await
    }
}

// ----------------------------------------------------------------------------
// 16.2 Actor Loop
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct AgentTiming {
    pub sample_interval: Duration,
    pub analysis_interval: Duration,
    pub queue_capacity: usize,
}

impl AgentTiming {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            sample_interval: config.sampling.interval,
            analysis_interval: config.analysis.interval,
            queue_capacity: config.command.queue_capacity,
        }
    }
}

pub struct Agent {
    context: AgentContext,
    timing: AgentTiming,
    commands: mpsc::Receiver<CommandEnvelope>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(context: AgentContext, timing: AgentTiming, shutdown: CancellationToken) -> (Self, AgentHandle) {
        let (sender, commands) = mpsc::channel(timing.queue_capacity.max(1));
        let agent = Self {
            context,
            timing,
            commands,
            shutdown,
        };
        (agent, AgentHandle { sender })
    }

    pub fn spawn(self) -> TokioJoinHandle<AgentContext> {
        tokio::spawn(self.run())
    }

    /// Run until the shutdown token fires; hands the context back afterwards
    pub async fn run(mut self) -> AgentContext {
        self.context.initialize().await;

        let mut sample_ticker = interval(self.timing.sample_interval);
        sample_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let first_analysis = TokioInstant::now() + self.timing.analysis_interval;
        let mut analysis_ticker = interval_at(first_analysis, self.timing.analysis_interval);
        analysis_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "sentinel::agent",
            sample_interval_ms = self.timing.sample_interval.as_millis() as u64,
            analysis_interval_ms = self.timing.analysis_interval.as_millis() as u64,
            "Agent loop started"
        );

        loop {
            let deadline = self.context.stabilization_deadline();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(target: "sentinel::agent", "Shutdown requested");
                    break;
                }
                _ = sleep_until_deadline(deadline) => {
                    self.context.stabilization_elapsed().await;
                }
                // Ticks before commands: a steady command stream must not stall sampling
                _ = sample_ticker.tick() => {
                    self.context.sample_tick().await;
                }
                _ = analysis_ticker.tick() => {
                    if let Err(e) = self.context.analysis_tick().await {
                        warn!(
                            target: "sentinel::analyzer",
                            error = %e,
                            recoverable = e.is_recoverable(),
                            "Analysis pass failed"
                        );
                    }
                }
                Some(envelope) = self.commands.recv() => {
                    let response = self.context.handle(envelope.request).await;
                    if envelope.reply.send(response).is_err() {
                        debug!(target: "sentinel::commands", "Caller went away before the response");
                    }
                }
            }
        }

        info!(
            target: "sentinel::agent",
            mode = %self.context.mode(),
            samples = self.context.window().len(),
            "Agent loop stopped"
        );
        self.context
    }
}

async fn sleep_until_deadline(deadline: Option<TokioInstant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}


// ============================================================================
// SECTION 17: UNIX SOCKET COMMAND SERVER
// ============================================================================
// One JSON request per line in, one JSON response per line out.
// ============================================================================

/// Bind the command socket, replacing a stale socket file
pub fn bind_command_socket(path: &Path) -> SentinelResult<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!(target: "sentinel::socket", path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(path)?;
    info!(target: "sentinel::socket", path = %path.display(), "Command socket listening");
    Ok(listener)
}

/// Accept connections until shutdown, then remove the socket file
pub async fn serve_commands(
    listener: UnixListener,
    path: PathBuf,
    handle: AgentHandle,
    shutdown: CancellationToken,
) -> SentinelResult<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handle = handle.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handle, shutdown).await {
                            debug!(target: "sentinel::socket", error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(target: "sentinel::socket", error = %e, "Accept failed"),
            },
        }
    }

    if let Err(e) = tokio::fs::remove_file(&path).await {
        debug!(target: "sentinel::socket", error = %e, "Could not remove socket file");
    }
    Ok(())
}

async fn serve_connection(stream: UnixStream, handle: AgentHandle, shutdown: CancellationToken) -> SentinelResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = TokioBufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let line = match line {
            Some(line) => line,
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => handle
                .call(request)
                .await
                .unwrap_or_else(|e| CommandResponse::error(e.to_string())),
            Err(e) => CommandResponse::error(format!("Malformed request: {}", e)),
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
    }
    Ok(())
}

/// Client side: one request over the socket, one response back
pub async fn send_over_socket(path: &Path, request: &CommandRequest) -> SentinelResult<CommandResponse> {
    let stream = UnixStream::connect(path).await?;
    let (reader, mut writer) = stream.into_split();

    let mut bytes = serde_json::to_vec(request)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;

    let mut lines = TokioBufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(line) => Ok(serde_json::from_str(&line)?),
        None => Err(SentinelError::Internal(
            "connection closed before a response arrived".into(),
        )),
    }
}

#[cfg(test)]
mod socket_tests {
    use super::mode_test_support::*;
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.sock");

        let h = harness();
        let config = AgentConfig::default();
        let context = AgentContext::new(&config, ScriptedAdapters::steady(40.0, 20.0), h.deps.clone()).unwrap();
        let shutdown = CancellationToken::new();
        let (agent, handle) = Agent::new(context, AgentTiming::from_config(&config), shutdown.clone());
        let agent_task = agent.spawn();

        let listener = bind_command_socket(&path).unwrap();
        let server = tokio::spawn(serve_commands(listener, path.clone(), handle, shutdown.clone()));

        let response = send_over_socket(&path, &CommandRequest::new("getStatus")).await.unwrap();
        assert_eq!(response.field("mode"), Some(&json!("adaptiveObservation")));

        let response = send_over_socket(&path, &CommandRequest::new("bogus")).await.unwrap();
        assert!(response.is_error());

        let stream = UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"not json\n").await.unwrap();
        let line = TokioBufReader::new(reader).lines().next_line().await.unwrap().unwrap();
        let response: CommandResponse = serde_json::from_str(&line).unwrap();
        assert!(response.is_error());

        shutdown.cancel();
        server.await.unwrap().unwrap();
        agent_task.await.unwrap();
        assert!(!path.exists());
    }
}

// ============================================================================
// SECTION 18: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Regime Sentinel CLI
#[derive(Parser, Debug)]
#[command(
    name = "sentinel",
    version,
    about = "Host monitoring agent that detects regime shifts in resource usage",
    long_about = "Regime Sentinel samples memory, processor and workload usage on a fixed \
                  cadence, looks for abrupt level shifts in those series and raises \
                  warnings an operator can acknowledge or answer with stabilization."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sentinel.toml", env = "SENTINEL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "SENTINEL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "SENTINEL_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent (default)
    Run,

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

    /// Ask a running agent for its status
    Status {
        /// Unix socket path to connect to
        #[arg(short, long, default_value = DEFAULT_UNIX_SOCKET_PATH)]
        socket: PathBuf,
    },

    /// Send any command to a running agent
    Command {
        /// Action name, e.g. acknowledgeWarning
        action: String,

        /// JSON payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Unix socket path to connect to
        #[arg(short, long, default_value = DEFAULT_UNIX_SOCKET_PATH)]
        socket: PathBuf,
    },
}

// ----------------------------------------------------------------------------
// 18.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> SentinelResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AgentConfig::load(config_path) {
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
            println!("  • Instance name: {}", config.agent.instance_name);
            println!("  • Sample interval: {}", humantime::format_duration(config.sampling.interval));
            println!("  • Analysis interval: {}", humantime::format_duration(config.analysis.interval));
            println!("  • Stabilization dwell: {}", humantime::format_duration(config.stabilization.dwell));
            println!("  • Confidence threshold: {}", config.defaults.confidence_threshold);
            println!("  • Window size: {}", config.defaults.window_size);
            println!(
                "  • Tracked metrics: {}",
                config
                    .analysis
                    .tracked_metrics
                    .iter()
                    .map(|m| m.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("  • Storage: {:?} ({})", config.storage.backend, config.storage.path.display());

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(SentinelError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> SentinelResult<()> {
    let config_str = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_version() {
    println!("🛰️  {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • Bounded sliding window of host samples");
    println!("  • Change-point detection with early-warning indicators");
    println!("  • Operator-driven stabilization with timed return");
    println!("  • Command API over a Unix socket");
}

async fn handle_status(socket: &Path) -> SentinelResult<()> {
    println!("Checking agent status at {}...", socket.display());

    let response = send_over_socket(socket, &CommandRequest::new("getStatus")).await?;
    if let CommandResponse::Error { error } = &response {
        println!("❌ {}", error);
        return Ok(());
    }

    let status: StatusReport = serde_json::from_value(response.into_json())?;
    let icon = match status.mode {
        Mode::AdaptiveObservation => "🟢",
        Mode::Warning => "🟠",
        Mode::Stabilization => "🔵",
    };
    println!("{} Mode: {}", icon, status.mode);
    println!("  • Samples in window: {}", status.sample_count);
    println!("  • Monitoring enabled: {}", status.monitoring_enabled);
    println!("  • Active warning: {}", status.has_warning);
    println!("  • Stabilization active: {}", status.stabilization_active);
    Ok(())
}

async fn handle_command(action: &str, payload: Option<&str>, socket: &Path) -> SentinelResult<()> {
    let request = match payload {
        Some(raw) => CommandRequest::with_payload(action, serde_json::from_str(raw)?),
        None => CommandRequest::new(action),
    };

    let response = send_over_socket(socket, &request).await?;
    let marker = if response.is_error() { "❌" } else { "✅" };
    println!("{} {}", marker, action);
    println!("{}", serde_json::to_string_pretty(&response.into_json())?);
    Ok(())
}

// ----------------------------------------------------------------------------
// 18.3 Agent Startup
// ----------------------------------------------------------------------------

async fn open_store(config: &StorageConfig) -> SentinelResult<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(JsonFileStore::open_or_recover(&config.path).await?),
    };
    Ok(store)
}

async fn wait_for_signal() -> SentinelResult<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "sentinel::engine", "Received SIGTERM");
        }
        result = signal::ctrl_c() => {
            result?;
            info!(target: "sentinel::engine", "Received SIGINT");
        }
    }
    Ok(())
}

/// Wire production collaborators, run until a signal arrives, shut down
pub async fn run_agent(config: AgentConfig) -> SentinelResult<()> {
    info!(
        target: "sentinel::engine",
        version = ENGINE_VERSION,
        instance = %config.agent.instance_name,
        "Starting Regime Sentinel"
    );

    let deps = Collaborators {
        store: open_store(&config.storage).await?,
        notifier: Arc::new(LogSink),
        shedder: Arc::new(LoggingShedder),
    };
    let adapters = Arc::new(HostAdapters::new(&config.sampling)?);
    let context = AgentContext::new(&config, adapters, deps)?;

    let shutdown = CancellationToken::new();
    let (agent, handle) = Agent::new(context, AgentTiming::from_config(&config), shutdown.clone());
    let agent_task = agent.spawn();

    let socket_task = if config.command.socket_enabled {
        let listener = bind_command_socket(&config.command.socket_path)?;
        Some(tokio::spawn(serve_commands(
            listener,
            config.command.socket_path.clone(),
            handle.clone(),
            shutdown.clone(),
        )))
    } else {
        None
    };

    wait_for_signal().await?;

    info!(target: "sentinel::engine", "Starting graceful shutdown");
    let shutdown_start = Instant::now();
    shutdown.cancel();

    match timeout(config.agent.shutdown_timeout, agent_task).await {
        Ok(Ok(context)) => info!(
            target: "sentinel::engine",
            mode = %context.mode(),
            "Agent stopped"
        ),
        Ok(Err(e)) => error!(target: "sentinel::engine", error = %e, "Agent task failed"),
        Err(_) => warn!(
            target: "sentinel::engine",
            timeout_secs = config.agent.shutdown_timeout.as_secs(),
            "Agent did not stop in time"
        ),
    }

    if let Some(task) = socket_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "sentinel::engine", error = %e, "Command socket failed"),
            Err(e) => warn!(target: "sentinel::engine", error = %e, "Command socket task failed"),
        }
    }

    info!(
        target: "sentinel::engine",
        duration_ms = shutdown_start.elapsed().as_millis() as u64,
        "Shutdown complete"
    );
    Ok(())
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

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
        Some(Commands::Status { socket }) => {
            handle_status(socket).await?;
            return Ok(());
        }
        Some(Commands::Command { action, payload, socket }) => {
            handle_command(action, payload.as_deref(), socket).await?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        AgentConfig::from_env().context("Failed to build config from environment")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    let _logging_guard = init_logging(&logging_config)?;

    info!("🛰️  {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    run_agent(config).await?;
    Ok(())
}
