use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level tuning knobs for the compositing service.
///
/// Every section is optional in the TOML source; missing values fall back to
/// the defaults used by an interactive editor with a single GPU context.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub texture_cache: TextureCacheConfig,
    #[serde(default)]
    pub resource_pool: ResourcePoolConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            scheduler: SchedulerConfig::default(),
            texture_cache: TextureCacheConfig::default(),
            resource_pool: ResourcePoolConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Concurrent dispatches on the render lane (render, initialize, resize).
    #[serde(default = "default_render_workers")]
    pub max_render_workers: usize,
    /// Concurrent dispatches on the dedicated filter lane.
    #[serde(default = "default_filter_workers")]
    pub max_filter_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_backoff_base",
        deserialize_with = "deserialize_duration"
    )]
    pub backoff_base: Duration,
    #[serde(
        default = "default_backoff_cap",
        deserialize_with = "deserialize_duration"
    )]
    pub backoff_cap: Duration,
    /// Fraction of the computed delay added as random jitter (0 disables).
    #[serde(default)]
    pub backoff_jitter: f32,
    #[serde(
        default = "default_task_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub task_timeout: Duration,
    /// Consecutive timeouts after which the worker is reported unresponsive.
    #[serde(default = "default_unresponsive_after")]
    pub unresponsive_after: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_render_workers: default_render_workers(),
            max_filter_workers: default_filter_workers(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            backoff_jitter: 0.0,
            task_timeout: default_task_timeout(),
            unresponsive_after: default_unresponsive_after(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TextureCacheConfig {
    /// Entries unused for more than this many render generations are released.
    #[serde(default = "default_generation_window")]
    pub generation_window: u64,
    /// Hard cap on resident source textures.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for TextureCacheConfig {
    fn default() -> Self {
        Self {
            generation_window: default_generation_window(),
            capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResourcePoolConfig {
    /// Maximum render targets kept resident (not checked out) across all sizes.
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            max_resident: default_max_resident(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Present a draft frame for interactive renders and refine it when idle.
    #[serde(default = "default_progressive")]
    pub progressive: bool,
    /// Upper bound applied to blur radii before kernel construction.
    #[serde(default = "default_max_blur_radius")]
    pub max_blur_radius: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            progressive: default_progressive(),
            max_blur_radius: default_max_blur_radius(),
        }
    }
}

fn default_render_workers() -> usize {
    1
}

fn default_filter_workers() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(5)
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_unresponsive_after() -> u32 {
    3
}

fn default_generation_window() -> u64 {
    120
}

fn default_cache_capacity() -> usize {
    64
}

fn default_max_resident() -> usize {
    16
}

fn default_progressive() -> bool {
    true
}

fn default_max_blur_radius() -> f32 {
    64.0
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: PipelineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        let scheduler = &self.scheduler;
        if scheduler.max_render_workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_render_workers must be at least 1".into(),
            ));
        }
        if scheduler.max_filter_workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_filter_workers must be at least 1".into(),
            ));
        }
        if scheduler.backoff_base.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.backoff_base must be greater than zero".into(),
            ));
        }
        if scheduler.backoff_base > scheduler.backoff_cap {
            return Err(ConfigError::Invalid(format!(
                "scheduler.backoff_base ({:?}) exceeds backoff_cap ({:?})",
                scheduler.backoff_base, scheduler.backoff_cap
            )));
        }
        if !(0.0..=1.0).contains(&scheduler.backoff_jitter) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.backoff_jitter must be within [0, 1], got {}",
                scheduler.backoff_jitter
            )));
        }
        if scheduler.task_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.task_timeout must be greater than zero".into(),
            ));
        }
        if scheduler.unresponsive_after == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.unresponsive_after must be at least 1".into(),
            ));
        }

        if self.texture_cache.capacity == 0 {
            return Err(ConfigError::Invalid(
                "texture_cache.capacity must be at least 1".into(),
            ));
        }
        if self.texture_cache.generation_window == 0 {
            return Err(ConfigError::Invalid(
                "texture_cache.generation_window must be at least 1".into(),
            ));
        }

        if self.resource_pool.max_resident == 0 {
            return Err(ConfigError::Invalid(
                "resource_pool.max_resident must be at least 1".into(),
            ));
        }

        if self.render.max_blur_radius.is_nan() || self.render.max_blur_radius < 0.0 {
            return Err(ConfigError::Invalid(
                "render.max_blur_radius must be >= 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[scheduler]
max_render_workers = 1
max_filter_workers = 2
max_retries = 5
backoff_base = "250ms"
backoff_cap = "4s"
task_timeout = 10
unresponsive_after = 2

[texture_cache]
generation_window = 60
capacity = 8

[resource_pool]
max_resident = 4

[render]
progressive = false
max_blur_radius = 32.0
"#;

    #[test]
    fn parses_sample_config() {
        let config = PipelineConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.scheduler.max_filter_workers, 2);
        assert_eq!(config.scheduler.max_retries, 5);
        assert_eq!(config.scheduler.backoff_base, Duration::from_millis(250));
        assert_eq!(config.scheduler.backoff_cap, Duration::from_secs(4));
        assert_eq!(config.scheduler.task_timeout, Duration::from_secs(10));
        assert_eq!(config.texture_cache.generation_window, 60);
        assert_eq!(config.texture_cache.capacity, 8);
        assert_eq!(config.resource_pool.max_resident, 4);
        assert!(!config.render.progressive);
        assert_eq!(config.render.max_blur_radius, 32.0);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = PipelineConfig::from_toml_str("version = 1").unwrap();
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(config.scheduler.max_render_workers, 1);
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.texture_cache.generation_window, 120);
        assert!(config.render.progressive);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = PipelineConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_base_above_cap() {
        let err = PipelineConfig::from_toml_str(
            r#"
version = 1

[scheduler]
backoff_base = "10s"
backoff_cap = "1s"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_render_workers() {
        let err = PipelineConfig::from_toml_str(
            r#"
version = 1

[scheduler]
max_render_workers = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_resource_pool() {
        let err = PipelineConfig::from_toml_str(
            r#"
version = 1

[resource_pool]
max_resident = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_duration() {
        let err = PipelineConfig::from_toml_str(
            r#"
version = 1

[scheduler]
task_timeout = "soon"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
