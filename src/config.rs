use std::time::Duration;

use tracing::info;

// ---------------------------------------------------------------------------
// Production configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Log output flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Complete server configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `GROUPCALL_`.  Defaults target a local media server on the standard
/// Kurento port.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Network ─────────────────────────────────────────────────────────
    /// Address to bind the HTTP(S) listener to.
    pub bind_addr: String,

    // ── Media server ────────────────────────────────────────────────────
    /// WebSocket URI of the media server's control endpoint.
    pub media_server_uri: String,
    /// Upper bound on every individual media server call.
    pub engine_timeout: Duration,
    /// Interval of the keepalive `ping` (zero disables it).
    pub engine_keepalive: Duration,

    // ── TLS ─────────────────────────────────────────────────────────────
    pub tls_enabled: bool,
    /// Path to PEM-encoded certificate chain.
    pub tls_cert_path: Option<String>,
    /// Path to PEM-encoded private key.
    pub tls_key_path: Option<String>,

    // ── Static client ───────────────────────────────────────────────────
    pub static_dir: String,

    // ── CORS ─────────────────────────────────────────────────────────────
    pub allowed_origins: String,

    // ── Logging ──────────────────────────────────────────────────────────
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8443".into(),
            media_server_uri: "ws://localhost:8888/kurento".into(),
            engine_timeout: Duration::from_millis(10_000),
            engine_keepalive: Duration::from_secs(240),
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            static_dir: "static".into(),
            allowed_origins: "*".into(),
            log_level: "info".into(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; malformed numbers fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let engine_timeout_ms = env_or("GROUPCALL_ENGINE_TIMEOUT_MS", "10000")
            .parse::<u64>()
            .unwrap_or(10_000);
        let engine_keepalive_secs = env_or("GROUPCALL_ENGINE_KEEPALIVE_SECS", "240")
            .parse::<u64>()
            .unwrap_or(240);

        Config {
            bind_addr: env_or("GROUPCALL_BIND_ADDR", &defaults.bind_addr),
            media_server_uri: env_or("GROUPCALL_MEDIA_SERVER_URI", &defaults.media_server_uri),
            engine_timeout: Duration::from_millis(engine_timeout_ms),
            engine_keepalive: Duration::from_secs(engine_keepalive_secs),
            tls_enabled: env_bool(lookup("GROUPCALL_TLS_ENABLED"), false),
            tls_cert_path: lookup("GROUPCALL_TLS_CERT_PATH").filter(|s| !s.is_empty()),
            tls_key_path: lookup("GROUPCALL_TLS_KEY_PATH").filter(|s| !s.is_empty()),
            static_dir: env_or("GROUPCALL_STATIC_DIR", &defaults.static_dir),
            allowed_origins: env_or("GROUPCALL_ALLOWED_ORIGINS", &defaults.allowed_origins),
            log_level: env_or("GROUPCALL_LOG_LEVEL", &defaults.log_level),
            log_format: LogFormat::parse(&env_or("GROUPCALL_LOG_FORMAT", "pretty")),
        }
    }

    /// Origins for the CORS layer; empty means permissive.
    pub fn cors_origins(&self) -> Vec<String> {
        if self.allowed_origins.trim() == "*" {
            return Vec::new();
        }
        csv(&self.allowed_origins)
    }

    pub fn log_summary(&self) {
        info!("──── Group Call Configuration ────");
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  media_server_uri   : {}", self.media_server_uri);
        info!("  engine_timeout     : {:?}", self.engine_timeout);
        info!("  engine_keepalive   : {:?}", self.engine_keepalive);
        info!("  tls_enabled        : {}", self.tls_enabled);
        if self.tls_enabled {
            info!(
                "  tls_cert_path      : {}",
                self.tls_cert_path.as_deref().unwrap_or("(not set)")
            );
            info!(
                "  tls_key_path       : {}",
                self.tls_key_path.as_deref().unwrap_or("(not set)")
            );
        }
        info!("  static_dir         : {}", self.static_dir);
        info!(
            "  cors_origins       : {}",
            if self.allowed_origins == "*" {
                "* (permissive)"
            } else {
                &self.allowed_origins
            }
        );
        info!("  log_level          : {}", self.log_level);
        info!("  log_format         : {:?}", self.log_format);
        info!("─────────────────────────────────");
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

fn csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
