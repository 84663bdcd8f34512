//! Environment-variable configuration, shared by every binary in the
//! workspace. Secrets are previewed (never fully logged) on load, matching
//! `rootsignal-core`'s `AppConfig::log_keys` pattern.

use crate::error::ConfigError;

/// Connection strings and tunables every service needs regardless of its
/// role in the pipeline.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub openai_api_key: String,

    pub gpu_lock_timeout_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub status_ttl_secs: u64,

    pub keyword_index_path: String,
    pub temp_audio_dir: String,
}

fn env_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_var_u64_or(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load from the process environment, falling back to a `.env` file if
    /// present. Required variables fail fast; tunables fall back to sane
    /// per-component defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: env_var("DATABASE_URL")?,
            redis_url: env_var("REDIS_URL")?,
            openai_api_key: env_var("OPENAI_API_KEY")?,
            gpu_lock_timeout_secs: env_var_u64_or("GPU_LOCK_TIMEOUT_SECS", 600)?,
            idempotency_ttl_secs: env_var_u64_or("IDEMPOTENCY_TTL_SECS", 86_400)?,
            status_ttl_secs: env_var_u64_or("STATUS_TTL_SECS", 3_600)?,
            keyword_index_path: env_var_or("KEYWORD_INDEX_PATH", "./data/keyword_index.bin"),
            temp_audio_dir: env_var_or("TEMP_AUDIO_DIR", "/tmp/podpipe-audio"),
        };

        config.log_redacted();
        Ok(config)
    }

    fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let n = val.len().min(5);
            format!("{}...({} chars)", &val[..n], val.len())
        }

        tracing::info!("config loaded");
        tracing::info!(database_url = %preview(&self.database_url));
        tracing::info!(redis_url = %preview(&self.redis_url));
        tracing::info!(openai_api_key = %preview(&self.openai_api_key));
        tracing::info!(
            gpu_lock_timeout_secs = self.gpu_lock_timeout_secs,
            idempotency_ttl_secs = self.idempotency_ttl_secs,
            status_ttl_secs = self.status_ttl_secs,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_reports_its_own_name() {
        // SAFETY: test-only env mutation, single-threaded within this test.
        unsafe {
            std::env::remove_var("DOES_NOT_EXIST_PODPIPE");
        }
        let err = env_var("DOES_NOT_EXIST_PODPIPE").unwrap_err();
        match err {
            ConfigError::MissingVar(name) => assert_eq!(name, "DOES_NOT_EXIST_PODPIPE"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn numeric_default_used_when_unset() {
        unsafe {
            std::env::remove_var("NOT_SET_TIMEOUT");
        }
        assert_eq!(env_var_u64_or("NOT_SET_TIMEOUT", 600).unwrap(), 600);
    }
}
