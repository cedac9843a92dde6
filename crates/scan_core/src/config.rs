//! Scan configuration
//!
//! [`ScanConfiguration`] is the immutable input of a run: which accounts to
//! log in with, which rectangles to cover, and the tunable [`ScanSettings`].
//! It is validated once, before any session is created, and then handed by
//! reference to the components that need it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::client::{AuthProvider, Credentials};
use crate::error::{ConfigResult, ConfigurationError};
use crate::geometry::{validate_sampling, BoundingRectangle};

fn default_radius() -> f64 {
    100.0
}

fn default_error_margin() -> f64 {
    0.05
}

fn default_cell_level() -> u8 {
    crate::cells::DEFAULT_QUERY_LEVEL
}

fn default_cell_window() -> usize {
    crate::cells::DEFAULT_WINDOW
}

fn default_throttle_ms() -> u64 {
    4000
}

/// Historical per-point budget was 4.5s including the throttle.
fn default_per_query_cost_ms() -> u64 {
    500
}

fn default_login_retry_ms() -> u64 {
    5000
}

fn default_idle_poll_ms() -> u64 {
    250
}

fn default_pass_count() -> u32 {
    6
}

fn default_pass_interval_secs() -> u64 {
    600
}

fn default_appearance_duration_ms() -> u64 {
    900_000
}

/// What a worker does with a response that does not decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Log it and count the item as completed.
    #[default]
    Skip,
    /// Treat it like a failed query and put the item back in the queue.
    Requeue,
}

/// Tunable knobs of a scan. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Sampling footprint radius in metres.
    #[serde(default = "default_radius")]
    pub radius: f64,
    /// Fraction by which the lattice is shrunk to force overlap.
    #[serde(default = "default_error_margin")]
    pub error_margin: f64,
    #[serde(default = "default_cell_level")]
    pub cell_level: u8,
    /// Neighbour cells requested on each side of the primary cell.
    #[serde(default = "default_cell_window")]
    pub cell_window: usize,
    /// Minimum spacing between two queries of the same session.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    /// Assumed network cost of one query, used only for estimates.
    #[serde(default = "default_per_query_cost_ms")]
    pub per_query_cost_ms: u64,
    #[serde(default = "default_login_retry_ms")]
    pub login_retry_ms: u64,
    /// None retries logins forever.
    #[serde(default)]
    pub max_login_attempts: Option<u32>,
    /// None retries a failed work item until it succeeds.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// How long an idle worker waits before looking at the queue again.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_pass_count")]
    pub pass_count: u32,
    #[serde(default = "default_pass_interval_secs")]
    pub pass_interval_secs: u64,
    /// How long a creature stays visible before it expires.
    #[serde(default = "default_appearance_duration_ms")]
    pub appearance_duration_ms: u64,
    #[serde(default)]
    pub malformed_policy: MalformedPolicy,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            error_margin: default_error_margin(),
            cell_level: default_cell_level(),
            cell_window: default_cell_window(),
            throttle_ms: default_throttle_ms(),
            per_query_cost_ms: default_per_query_cost_ms(),
            login_retry_ms: default_login_retry_ms(),
            max_login_attempts: None,
            max_attempts: None,
            idle_poll_ms: default_idle_poll_ms(),
            pass_count: default_pass_count(),
            pass_interval_secs: default_pass_interval_secs(),
            appearance_duration_ms: default_appearance_duration_ms(),
            malformed_policy: MalformedPolicy::default(),
        }
    }
}

impl ScanSettings {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn per_query_cost(&self) -> Duration {
        Duration::from_millis(self.per_query_cost_ms)
    }

    pub fn appearance_duration(&self) -> Duration {
        Duration::from_millis(self.appearance_duration_ms)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            throttle: self.throttle(),
            login_retry: Duration::from_millis(self.login_retry_ms),
            max_login_attempts: self.max_login_attempts,
            max_attempts: self.max_attempts,
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            malformed_policy: self.malformed_policy,
            appearance_duration: self.appearance_duration(),
        }
    }

    pub fn pass_schedule(&self) -> PassSchedule {
        PassSchedule {
            count: self.pass_count,
            interval: Duration::from_secs(self.pass_interval_secs),
        }
    }

    /// Range checks that do not depend on the work list.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_sampling(self.radius, self.error_margin)?;
        if self.cell_level > crate::cells::MAX_LEVEL {
            return Err(ConfigurationError::InvalidSetting(format!(
                "cell_level {} exceeds {}",
                self.cell_level,
                crate::cells::MAX_LEVEL
            )));
        }
        if self.pass_count == 0 {
            return Err(ConfigurationError::InvalidSetting("pass_count must be at least 1".to_string()));
        }
        if self.pass_count > 1 && self.pass_interval_secs == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "pass_interval_secs must be positive when running several passes".to_string(),
            ));
        }
        if self.max_attempts == Some(0) || self.max_login_attempts == Some(0) {
            return Err(ConfigurationError::InvalidSetting(
                "attempt bounds must be at least 1 when set".to_string(),
            ));
        }
        if self.idle_poll_ms == 0 {
            return Err(ConfigurationError::InvalidSetting("idle_poll_ms must be positive".to_string()));
        }
        if self.appearance_duration_ms == 0 {
            return Err(ConfigurationError::InvalidSetting(
                "appearance_duration_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker pool parameters, derived from [`ScanSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub throttle: Duration,
    pub login_retry: Duration,
    pub max_login_attempts: Option<u32>,
    pub max_attempts: Option<u32>,
    pub idle_poll: Duration,
    pub malformed_policy: MalformedPolicy,
    pub appearance_duration: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        ScanSettings::default().pool_settings()
    }
}

/// When passes start, relative to the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSchedule {
    pub count: u32,
    pub interval: Duration,
}

impl PassSchedule {
    /// Offset of pass `k` (zero based) from the run start.
    pub fn offset_for_pass(&self, k: u32) -> Duration {
        self.interval * k
    }
}

impl Default for PassSchedule {
    fn default() -> Self {
        ScanSettings::default().pass_schedule()
    }
}

/// Everything a run needs to know up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfiguration {
    pub auth_service: AuthProvider,
    pub users: Vec<Credentials>,
    pub work: Vec<BoundingRectangle>,
    #[serde(default)]
    pub scanner: ScanSettings,
}

impl ScanConfiguration {
    /// Provider to log `credentials` in with; a per-user setting wins.
    pub fn provider_for(&self, credentials: &Credentials) -> AuthProvider {
        credentials.auth_service.unwrap_or(self.auth_service)
    }

    pub fn worker_count(&self) -> usize {
        self.users.len()
    }

    /// Rejects anything that would make the run fail or misbehave later.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.users.is_empty() {
            return Err(ConfigurationError::NoUsers);
        }
        if let Some(index) = self.users.iter().position(|user| user.username.trim().is_empty()) {
            return Err(ConfigurationError::EmptyUsername(index));
        }
        if self.work.is_empty() {
            return Err(ConfigurationError::NoWork);
        }
        for (index, rect) in self.work.iter().enumerate() {
            rect.validate()
                .map_err(|source| ConfigurationError::Rectangle { index, source })?;
            if rect.is_degenerate() {
                return Err(ConfigurationError::DegenerateRectangle { index });
            }
        }
        self.scanner.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeometryError;

    fn user(name: &str) -> Credentials {
        Credentials {
            username: name.to_string(),
            password: "secret".to_string(),
            auth_service: None,
        }
    }

    fn sample() -> ScanConfiguration {
        ScanConfiguration {
            auth_service: AuthProvider::Ptc,
            users: vec![user("alpha"), user("beta")],
            work: vec![BoundingRectangle::new(40.0, -74.0, 40.01, -73.99)],
            scanner: ScanSettings::default(),
        }
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ScanSettings::default();
        assert_eq!(settings.radius, 100.0);
        assert_eq!(settings.error_margin, 0.05);
        assert_eq!(settings.cell_level, 15);
        assert_eq!(settings.cell_window, 10);
        assert_eq!(settings.throttle() + settings.per_query_cost(), Duration::from_millis(4500));
        assert_eq!(settings.pass_count, 6);
        assert_eq!(settings.appearance_duration(), Duration::from_secs(900));
        assert_eq!(settings.malformed_policy, MalformedPolicy::Skip);
        assert!(settings.max_attempts.is_none());
    }

    #[test]
    fn test_pass_offsets() {
        let schedule = PassSchedule::default();
        assert_eq!(schedule.offset_for_pass(0), Duration::ZERO);
        assert_eq!(schedule.offset_for_pass(1), Duration::from_secs(600));
        assert_eq!(schedule.offset_for_pass(5), Duration::from_secs(3000));
    }

    #[test]
    fn test_parse_minimal_json() {
        let json = r#"{
            "auth_service": "google",
            "users": [
                {"username": "alpha", "password": "a"},
                {"username": "beta", "password": "b", "auth_service": "ptc"}
            ],
            "work": [[40.01, -73.99, 40.0, -74.0]]
        }"#;
        let config: ScanConfiguration = serde_json::from_str(json).unwrap();

        assert_eq!(config.auth_service, AuthProvider::Google);
        assert_eq!(config.provider_for(&config.users[0]), AuthProvider::Google);
        assert_eq!(config.provider_for(&config.users[1]), AuthProvider::Ptc);
        assert_eq!(config.work[0], BoundingRectangle::new(40.0, -74.0, 40.01, -73.99));
        assert_eq!(config.scanner, ScanSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_scanner_section_keeps_defaults() {
        let json = r#"{
            "auth_service": "ptc",
            "users": [{"username": "alpha", "password": "a"}],
            "work": [[0, 0, 0.01, 0.01]],
            "scanner": {"radius": 70, "malformed_policy": "requeue", "max_attempts": 3}
        }"#;
        let config: ScanConfiguration = serde_json::from_str(json).unwrap();

        assert_eq!(config.scanner.radius, 70.0);
        assert_eq!(config.scanner.malformed_policy, MalformedPolicy::Requeue);
        assert_eq!(config.scanner.max_attempts, Some(3));
        assert_eq!(config.scanner.throttle_ms, 4000);
    }

    #[test]
    fn test_unknown_provider_is_rejected_on_load() {
        let json = r#"{"auth_service": "facebook", "users": [], "work": []}"#;
        let err = serde_json::from_str::<ScanConfiguration>(json).unwrap_err();
        assert!(err.to_string().contains("facebook"));
    }

    #[test]
    fn test_validate_rejects_missing_users_and_work() {
        let mut config = sample();
        config.users.clear();
        assert_eq!(config.validate(), Err(ConfigurationError::NoUsers));

        let mut config = sample();
        config.users[1].username = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigurationError::EmptyUsername(1)));

        let mut config = sample();
        config.work.clear();
        assert_eq!(config.validate(), Err(ConfigurationError::NoWork));
    }

    #[test]
    fn test_validate_rejects_bad_rectangles() {
        let mut config = sample();
        config.work.push(BoundingRectangle::new(40.0, -74.0, 40.0, -73.9));
        assert_eq!(config.validate(), Err(ConfigurationError::DegenerateRectangle { index: 1 }));

        let mut config = sample();
        config.work = vec![BoundingRectangle::new(10.0, -170.0, 11.0, 170.0)];
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Rectangle {
                index: 0,
                source: GeometryError::AntimeridianSpan(_)
            })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = sample();
        config.scanner.radius = 0.0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::Geometry(GeometryError::InvalidRadius(0.0)))
        );

        let mut config = sample();
        config.scanner.error_margin = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Geometry(GeometryError::InvalidErrorMargin(_)))
        ));

        let mut config = sample();
        config.scanner.pass_count = 0;
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidSetting(_))));

        let mut config = sample();
        config.scanner.max_attempts = Some(0);
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidSetting(_))));
    }
}
