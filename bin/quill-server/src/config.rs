//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for quill-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily-rolling log files.  Stdout only when unset.
    pub log_dir: Option<PathBuf>,

    /// Model and tool-protocol settings file (TOML, or JSON by extension).
    /// Built-in defaults are used when unset.
    pub settings_path: Option<PathBuf>,

    /// Serve Swagger UI at `/swagger-ui` (default: `true`).
    pub enable_swagger: bool,

    /// Comma-separated CORS origin allow-list.  Wildcard when unset.
    pub cors_allowed_origins: Option<String>,

    /// Per-handler limit for registered tools.  Unlimited when unset or zero.
    pub tool_timeout: Option<Duration>,

    /// Key required on API routes, as a bearer token or `api-key` header.
    /// Open when unset.
    pub api_key: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("QUILL_BIND", "0.0.0.0:3000"),
            log_level: env_or("QUILL_LOG", "info"),
            log_json: parse_bool("QUILL_LOG_JSON", false),
            log_dir: env_opt("QUILL_LOG_DIR").map(PathBuf::from),
            settings_path: env_opt("QUILL_SETTINGS").map(PathBuf::from),
            enable_swagger: parse_bool("QUILL_ENABLE_SWAGGER", true),
            cors_allowed_origins: env_opt("QUILL_CORS_ORIGINS"),
            tool_timeout: match parse_env::<u64>("QUILL_TOOL_TIMEOUT_SECS", 0) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            api_key: env_opt("QUILL_API_KEY"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".into(),
            log_level: "info".into(),
            log_json: false,
            log_dir: None,
            settings_path: None,
            enable_swagger: true,
            cors_allowed_origins: None,
            tool_timeout: None,
            api_key: None,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
