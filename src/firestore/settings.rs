use std::time::Duration;

use crate::firestore::constants::{
    CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_HOST, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
    EMULATOR_HOST_ENV, MINIMUM_CACHE_SIZE_BYTES,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::util::BackoffSettings;

/// Client configuration supplied when the database client is created.
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    /// REST host, without scheme.
    pub host: String,
    pub ssl: bool,
    /// Target size of the local cache. `CACHE_SIZE_UNLIMITED` disables
    /// garbage collection.
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    /// Reconnect policy of the listen and write streams.
    pub stream_backoff: BackoffSettings,
    /// How long a stream may stay open without listeners or writes.
    pub stream_idle_timeout: Duration,
    /// Time the client waits for the first watch response before reporting
    /// itself offline.
    pub online_state_timeout: Duration,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ssl: true,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            stream_backoff: BackoffSettings::default(),
            stream_idle_timeout: Duration::from_secs(60),
            online_state_timeout: Duration::from_secs(10),
        }
    }
}

impl FirestoreSettings {
    /// Applies `FIRESTORE_EMULATOR_HOST` when set, switching to plain HTTP.
    pub fn with_environment_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(EMULATOR_HOST_ENV) {
            let host = host.trim();
            if !host.is_empty() {
                log::debug!("using emulator host {host} from {EMULATOR_HOST_ENV}");
                self.host = host.to_string();
                self.ssl = false;
            }
        }
        self
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.host.trim().is_empty() {
            return Err(invalid_argument("host must not be empty"));
        }
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache_size_bytes cannot be less than {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument("max_concurrent_limbo_resolutions must be positive"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }

    pub fn gc_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn defaults_are_valid() {
        let settings = FirestoreSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.base_url(), "https://firestore.googleapis.com");
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert!(settings.gc_enabled());
    }

    #[test]
    fn rejects_small_cache() {
        let settings = FirestoreSettings {
            cache_size_bytes: 1024,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn unlimited_cache_disables_gc() {
        let settings = FirestoreSettings {
            cache_size_bytes: CACHE_SIZE_UNLIMITED,
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
        assert!(!settings.gc_enabled());
    }
}
