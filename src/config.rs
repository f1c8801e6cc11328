use std::{
    env,
    fs,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::security;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug_mode: bool,
    pub static_files_dir: PathBuf,
    pub max_requests_per_minute: u32,
    pub max_code_length: usize,
    pub max_output_length: usize,
    pub execution_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub go_executable_path: PathBuf,
    pub temp_dir: PathBuf,
    pub cleanup_interval: Duration,
    pub max_cache_size: usize,
    pub cache_ttl: Duration,
    pub blacklisted_imports: Vec<String>,
    pub log_level: String,
    pub log_format: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_string("SERVER_HOST", "0.0.0.0"),
            port: env_parse("SERVER_PORT", 8080u16),
            debug_mode: env_bool("DEBUG_MODE", false),
            static_files_dir: PathBuf::from(env_string("STATIC_FILES_DIR", "/app/build")),
            max_requests_per_minute: env_parse("MAX_REQUESTS_PER_MINUTE", 30u32),
            max_code_length: env_parse("MAX_CODE_LENGTH", 10_000usize),
            max_output_length: env_parse("MAX_OUTPUT_LENGTH", 10_000usize),
            execution_timeout: Duration::from_secs(env_parse("EXECUTION_TIMEOUT_SECONDS", 10u64)),
            allowed_origins: env_csv("ALLOWED_ORIGINS", "*"),
            go_executable_path: PathBuf::from(env_string(
                "GO_EXECUTABLE_PATH",
                "/usr/local/go/bin/go",
            )),
            temp_dir: PathBuf::from(env_string("TEMP_DIR", "")),
            cleanup_interval: Duration::from_secs(
                env_parse("CLEANUP_INTERVAL_MINUTES", 60u64).saturating_mul(60),
            ),
            max_cache_size: env_parse("MAX_CACHE_SIZE", 100usize),
            cache_ttl: Duration::from_secs(
                env_parse("CACHE_TTL_MINUTES", 30u64).saturating_mul(60),
            ),
            blacklisted_imports: env_csv("BLACKLISTED_IMPORTS", security::DEFAULT_DENYLIST),
            log_level: env_string("LOG_LEVEL", "info"),
            log_format: env_string("LOG_FORMAT", "json"),
        }
    }

    /// Clamps below-floor values and resolves filesystem-dependent fields.
    /// Invalid settings degrade to safe minimums instead of aborting startup.
    pub fn normalized(mut self) -> Self {
        if self.max_requests_per_minute < 1 {
            tracing::warn!("MAX_REQUESTS_PER_MINUTE below minimum, clamping to 1");
            self.max_requests_per_minute = 1;
        }

        if self.max_code_length < 100 {
            tracing::warn!("MAX_CODE_LENGTH below minimum, clamping to 100");
            self.max_code_length = 100;
        }

        if self.execution_timeout < Duration::from_secs(1) {
            tracing::warn!("EXECUTION_TIMEOUT_SECONDS below minimum, clamping to 1 second");
            self.execution_timeout = Duration::from_secs(1);
        }

        if self.cleanup_interval < Duration::from_secs(60) {
            tracing::warn!("CLEANUP_INTERVAL_MINUTES below minimum, clamping to 1 minute");
            self.cleanup_interval = Duration::from_secs(60);
        }

        if self.max_cache_size > 0 && self.cache_ttl < Duration::from_secs(60) {
            tracing::warn!("CACHE_TTL_MINUTES below minimum, clamping to 1 minute");
            self.cache_ttl = Duration::from_secs(60);
        }

        if self.temp_dir.as_os_str().is_empty() {
            self.temp_dir = env::temp_dir();
        } else if !self.temp_dir.is_dir() {
            if let Err(err) = fs::create_dir_all(&self.temp_dir) {
                tracing::error!(
                    dir = %self.temp_dir.display(),
                    error = %err,
                    "temp dir not usable, falling back to the system temp dir"
                );
                self.temp_dir = env::temp_dir();
            }
        }

        if !self.go_executable_path.is_file() {
            tracing::warn!(
                path = %self.go_executable_path.display(),
                "go executable not found; executions will fail until it is available"
            );
        }

        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| {
                tracing::warn!(host = %self.host, "invalid SERVER_HOST, binding to 0.0.0.0");
                SocketAddr::from(([0, 0, 0, 0], self.port))
            })
    }
}

pub(crate) fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "y")
}

pub fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_csv(key: &str, default: &str) -> Vec<String> {
    split_csv(&env_string(key, default))
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(temp_dir: PathBuf) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            debug_mode: false,
            static_files_dir: PathBuf::from("/tmp/static"),
            max_requests_per_minute: 30,
            max_code_length: 10_000,
            max_output_length: 10_000,
            execution_timeout: Duration::from_secs(10),
            allowed_origins: vec!["*".to_string()],
            go_executable_path: PathBuf::from("/usr/local/go/bin/go"),
            temp_dir,
            cleanup_interval: Duration::from_secs(3600),
            max_cache_size: 100,
            cache_ttl: Duration::from_secs(1800),
            blacklisted_imports: split_csv(security::DEFAULT_DENYLIST),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }

    #[test]
    fn clamps_below_floor_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path().to_path_buf());
        config.max_requests_per_minute = 0;
        config.max_code_length = 10;
        config.execution_timeout = Duration::from_millis(200);
        config.cache_ttl = Duration::from_secs(5);

        let config = config.normalized();

        assert_eq!(config.max_requests_per_minute, 1);
        assert_eq!(config.max_code_length, 100);
        assert_eq!(config.execution_timeout, Duration::from_secs(1));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn falls_back_to_system_temp_when_dir_is_not_creatable() {
        let config = base_config(PathBuf::from("/dev/null/not-a-dir")).normalized();
        assert_eq!(config.temp_dir, env::temp_dir());
    }

    #[test]
    fn empty_temp_dir_means_system_temp() {
        let config = base_config(PathBuf::new()).normalized();
        assert_eq!(config.temp_dir, env::temp_dir());
    }

    #[test]
    fn creates_missing_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("scratch/go");
        let config = base_config(nested.clone()).normalized();
        assert_eq!(config.temp_dir, nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn bool_coercion_matches_the_documented_forms() {
        for raw in ["true", "TRUE", "1", "yes", "Y"] {
            assert!(parse_bool(raw), "{raw} should parse as true");
        }
        for raw in ["false", "0", "no", "si", ""] {
            assert!(!parse_bool(raw), "{raw} should parse as false");
        }
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" os/exec, net ,,plugin "),
            vec!["os/exec", "net", "plugin"]
        );
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn invalid_host_falls_back_to_wildcard_bind() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path().to_path_buf());
        config.host = "not a host".to_string();
        config.port = 9000;
        assert_eq!(config.bind_addr(), SocketAddr::from(([0, 0, 0, 0], 9000)));
    }
}
