use std::path::PathBuf;

/// Server configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub environment: String,
    /// Base data directory (scratch dirs, default db and services locations).
    pub data_dir: PathBuf,
    /// SQLite path; `:memory:` selects an in-memory database.
    pub db_path: String,
    /// Directory service entry paths resolve against.
    pub services_root: PathBuf,
    /// Default wall-clock budget for one sandbox invocation.
    pub sandbox_timeout_ms: u64,
    /// How long an untouched flow session stays claimable.
    pub flow_ttl_ms: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("SWITCHBOARD_DATA_DIR").ok().as_deref(),
            std::env::var("SWITCHBOARD_DB").ok().as_deref(),
            std::env::var("SWITCHBOARD_SERVICES_DIR").ok().as_deref(),
            std::env::var("SANDBOX_TIMEOUT_MS").ok().as_deref(),
            std::env::var("FLOW_TTL_MS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env
    /// vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        port: Option<&str>,
        environment: Option<&str>,
        data_dir: Option<&str>,
        db_path: Option<&str>,
        services_dir: Option<&str>,
        sandbox_timeout_ms: Option<&str>,
        flow_ttl_ms: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(8082);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let data_dir = data_dir
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".switchboard")
            });

        let db_path = db_path
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| data_dir.join("switchboard.db").to_string_lossy().into_owned());

        let services_root = services_dir
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("services"));

        let sandbox_timeout_ms = sandbox_timeout_ms
            .and_then(|v| v.parse().ok())
            .unwrap_or(2000);

        let flow_ttl_ms = flow_ttl_ms
            .and_then(|v| v.parse().ok())
            .unwrap_or(10 * 60 * 1000);

        Config {
            port,
            environment,
            data_dir,
            db_path,
            services_root,
            sandbox_timeout_ms,
            flow_ttl_ms,
        }
    }
}
