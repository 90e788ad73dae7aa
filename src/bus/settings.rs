//! Broker client tunables.
//!
//! `BrokerSettings` is the flat, all-optional surface exposed to users and
//! configuration files. `TransportOptions` is the broker client's own option
//! set with its defaults; settings are copied onto it field by field, each
//! field overriding the default only when it is non-zero / non-empty.

use std::time::Duration;

use serde::Deserialize;

use crate::breaker::{BreakerConfig, DEFAULT_THRESHOLD, DEFAULT_TIMEOUT};

/// Optional broker client tunables. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub dial_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub lookupd_poll_interval_ms: Option<u64>,
    pub lookupd_poll_jitter: Option<f64>,
    pub max_requeue_delay_ms: Option<u64>,
    pub default_requeue_delay_ms: Option<u64>,
    pub max_backoff_duration_ms: Option<u64>,
    pub backoff_multiplier_ms: Option<u64>,
    /// Deliveries before a message is given up on (0 = unlimited).
    pub max_attempts: Option<u16>,
    pub low_rdy_idle_timeout_ms: Option<u64>,
    pub rdy_redistribute_interval_ms: Option<u64>,
    pub client_id: Option<String>,
    pub hostname: Option<String>,
    pub user_agent: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub sample_rate: Option<i32>,
    pub tls_v1: Option<bool>,
    pub deflate: Option<bool>,
    pub deflate_level: Option<i32>,
    pub snappy: Option<bool>,
    pub output_buffer_size: Option<i64>,
    pub output_buffer_timeout_ms: Option<u64>,
    pub max_in_flight: Option<usize>,
    pub msg_timeout_ms: Option<u64>,
    pub auth_secret: Option<String>,
}

/// Resolved broker client options.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub lookupd_poll_interval: Duration,
    pub lookupd_poll_jitter: f64,
    pub max_requeue_delay: Duration,
    pub default_requeue_delay: Duration,
    pub max_backoff_duration: Duration,
    pub backoff_multiplier: Duration,
    pub max_attempts: u16,
    pub low_rdy_idle_timeout: Duration,
    pub rdy_redistribute_interval: Duration,
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: Duration,
    pub sample_rate: i32,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: Duration,
    pub max_in_flight: usize,
    pub msg_timeout: Duration,
    pub auth_secret: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            max_requeue_delay: Duration::from_secs(15 * 60),
            default_requeue_delay: Duration::from_secs(90),
            max_backoff_duration: Duration::from_secs(2 * 60),
            backoff_multiplier: Duration::from_secs(1),
            max_attempts: 5,
            low_rdy_idle_timeout: Duration::from_secs(10),
            rdy_redistribute_interval: Duration::from_secs(5),
            client_id: String::new(),
            hostname: String::new(),
            user_agent: concat!("msgbus/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: Duration::from_secs(30),
            sample_rate: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            max_in_flight: 1,
            msg_timeout: Duration::from_secs(60),
            auth_secret: String::new(),
        }
    }
}

fn set_duration(target: &mut Duration, ms: Option<u64>) {
    if let Some(ms) = ms.filter(|ms| *ms != 0) {
        *target = Duration::from_millis(ms);
    }
}

fn set_string(target: &mut String, value: &Option<String>) {
    if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
        target.clone_from(value);
    }
}

fn set_flag(target: &mut bool, value: Option<bool>) {
    if value == Some(true) {
        *target = true;
    }
}

fn set_number<T: Copy + PartialEq + Default>(target: &mut T, value: Option<T>) {
    if let Some(value) = value.filter(|v| *v != T::default()) {
        *target = value;
    }
}

impl TransportOptions {
    /// Copy every explicitly set field of `settings` over the defaults.
    pub fn apply(&mut self, settings: &BrokerSettings) {
        set_duration(&mut self.dial_timeout, settings.dial_timeout_ms);
        set_duration(&mut self.read_timeout, settings.read_timeout_ms);
        set_duration(&mut self.write_timeout, settings.write_timeout_ms);
        set_duration(
            &mut self.lookupd_poll_interval,
            settings.lookupd_poll_interval_ms,
        );
        set_number(&mut self.lookupd_poll_jitter, settings.lookupd_poll_jitter);
        set_duration(&mut self.max_requeue_delay, settings.max_requeue_delay_ms);
        set_duration(
            &mut self.default_requeue_delay,
            settings.default_requeue_delay_ms,
        );
        set_duration(
            &mut self.max_backoff_duration,
            settings.max_backoff_duration_ms,
        );
        set_duration(&mut self.backoff_multiplier, settings.backoff_multiplier_ms);
        set_number(&mut self.max_attempts, settings.max_attempts);
        set_duration(
            &mut self.low_rdy_idle_timeout,
            settings.low_rdy_idle_timeout_ms,
        );
        set_duration(
            &mut self.rdy_redistribute_interval,
            settings.rdy_redistribute_interval_ms,
        );
        set_string(&mut self.client_id, &settings.client_id);
        set_string(&mut self.hostname, &settings.hostname);
        set_string(&mut self.user_agent, &settings.user_agent);
        set_duration(
            &mut self.heartbeat_interval,
            settings.heartbeat_interval_ms,
        );
        set_number(&mut self.sample_rate, settings.sample_rate);
        set_flag(&mut self.tls_v1, settings.tls_v1);
        set_flag(&mut self.deflate, settings.deflate);
        set_number(&mut self.deflate_level, settings.deflate_level);
        set_flag(&mut self.snappy, settings.snappy);
        set_number(&mut self.output_buffer_size, settings.output_buffer_size);
        set_duration(
            &mut self.output_buffer_timeout,
            settings.output_buffer_timeout_ms,
        );
        set_number(&mut self.max_in_flight, settings.max_in_flight);
        set_duration(&mut self.msg_timeout, settings.msg_timeout_ms);
        set_string(&mut self.auth_secret, &settings.auth_secret);
    }

    /// Delay before redelivering a message that failed on its `attempts`-th
    /// delivery: linear in the attempt count, capped at `max_requeue_delay`.
    pub fn requeue_delay(&self, attempts: u16) -> Duration {
        self.default_requeue_delay
            .saturating_mul(u32::from(attempts.max(1)))
            .min(self.max_requeue_delay)
    }
}

impl From<&BrokerSettings> for TransportOptions {
    fn from(settings: &BrokerSettings) -> Self {
        let mut options = Self::default();
        options.apply(settings);
        options
    }
}

/// Circuit breaker settings as they appear in configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Period after which closed-state counts are cleared (0 = never).
    pub interval_ms: u64,
    /// Open-state cool-down before a trial call (0 = 60s).
    pub timeout_ms: u64,
    /// Consecutive failures tolerated before the breaker opens (0 = 5).
    pub threshold: u32,
}

impl BreakerSettings {
    /// Breaker configuration named `name`, without a state observer.
    pub fn to_config(&self, name: &str) -> BreakerConfig {
        BreakerConfig {
            name: name.to_string(),
            interval: Duration::from_millis(self.interval_ms),
            timeout: match self.timeout_ms {
                0 => DEFAULT_TIMEOUT,
                ms => Duration::from_millis(ms),
            },
            threshold: match self.threshold {
                0 => DEFAULT_THRESHOLD,
                n => n,
            },
            on_state_change: None,
        }
    }
}
