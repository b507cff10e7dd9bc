//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, ClearScope, MAX_AGE_LIMIT_SECS};

pub use cli::{
    BackendArgs, BackendOverrides, CliArgs, Command, InvalidateArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "readthrough";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BACKEND_HOST: &str = "localhost";
const DEFAULT_BACKEND_PORT: u16 = 6379;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RECONNECT_ATTEMPTS: u64 = 3;
const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
const DEFAULT_COOLDOWN_SECS: u64 = 10;
const DEFAULT_MEMORY_CAPACITY: u64 = 10_000;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
    pub cache: CacheSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend `{other}`, expected memory or redis")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect_attempts: NonZeroU32,
    pub failure_threshold: NonZeroU32,
    pub cooldown: Duration,
    pub memory_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_age: Duration,
    pub excluded_prefixes: Vec<String>,
    pub include_query: bool,
    pub namespace: String,
    pub max_body_bytes: NonZeroUsize,
    pub clear_scope: ClearScope,
    pub error_log_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// `None` leaves the proxy without a target; every request answers 502.
    pub base_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("READTHROUGH")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.excluded_prefixes")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Stats(args)) | Some(Command::Clear(args)) => {
            raw.apply_backend_overrides(&args.backend)
        }
        Some(Command::Invalidate(args)) => raw.apply_backend_overrides(&args.backend),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    cache: RawCacheSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.cache_max_age_seconds {
            self.cache.max_age_seconds = Some(seconds);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }

        self.apply_backend_overrides(&overrides.backend);
    }

    fn apply_backend_overrides(&mut self, overrides: &BackendOverrides) {
        if let Some(kind) = overrides.backend_kind.as_ref() {
            self.backend.kind = Some(kind.clone());
        }
        if let Some(host) = overrides.backend_host.as_ref() {
            self.backend.host = Some(host.clone());
        }
        if let Some(port) = overrides.backend_port {
            self.backend.port = Some(port);
        }
        if let Some(database) = overrides.backend_database {
            self.backend.database = Some(database);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            backend,
            cache,
            upstream,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            backend: build_backend_settings(backend)?,
            cache: build_cache_settings(cache)?,
            upstream: build_upstream_settings(upstream)?,
        })
    }

    /// Runtime cache configuration derived from the `[cache]` section.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(&self.cache)
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let kind = match backend.kind {
        Some(kind) => BackendKind::from_str(&kind)
            .map_err(|reason| LoadError::invalid("backend.kind", reason))?,
        None => BackendKind::Redis,
    };

    let host = backend
        .host
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string());
    if host.is_empty() {
        return Err(LoadError::invalid("backend.host", "host must not be empty"));
    }

    let port = backend.port.unwrap_or(DEFAULT_BACKEND_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "backend.port",
            "port must be greater than zero",
        ));
    }

    let password = backend.password.filter(|value| !value.is_empty());

    let connect_timeout_ms = backend
        .connect_timeout_ms
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
    if connect_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "backend.connect_timeout_ms",
            "must be greater than zero",
        ));
    }

    let command_timeout_ms = backend
        .command_timeout_ms
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS);
    if command_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "backend.command_timeout_ms",
            "must be greater than zero",
        ));
    }

    let reconnect_attempts = non_zero_u32(
        backend
            .reconnect_attempts
            .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
        "backend.reconnect_attempts",
    )?;
    let failure_threshold = non_zero_u32(
        backend
            .failure_threshold
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
        "backend.failure_threshold",
    )?;

    let cooldown_secs = backend.cooldown_seconds.unwrap_or(DEFAULT_COOLDOWN_SECS);
    if cooldown_secs == 0 {
        return Err(LoadError::invalid(
            "backend.cooldown_seconds",
            "must be greater than zero",
        ));
    }

    let memory_capacity = non_zero_usize(
        backend.memory_capacity.unwrap_or(DEFAULT_MEMORY_CAPACITY),
        "backend.memory_capacity",
    )?;

    Ok(BackendSettings {
        kind,
        host,
        port,
        password,
        database: backend.database.unwrap_or(0),
        connect_timeout: Duration::from_millis(connect_timeout_ms),
        command_timeout: Duration::from_millis(command_timeout_ms),
        reconnect_attempts,
        failure_threshold,
        cooldown: Duration::from_secs(cooldown_secs),
        memory_capacity,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let max_age_secs = cache.max_age_seconds.unwrap_or(defaults.max_age_secs);
    if max_age_secs == 0 {
        return Err(LoadError::invalid(
            "cache.max_age_seconds",
            "must be greater than zero",
        ));
    }
    if max_age_secs > MAX_AGE_LIMIT_SECS {
        return Err(LoadError::invalid(
            "cache.max_age_seconds",
            format!("must be at most {MAX_AGE_LIMIT_SECS} (one year)"),
        ));
    }

    let excluded_prefixes = match cache.excluded_prefixes {
        Some(prefixes) => prefixes
            .into_iter()
            .map(|prefix| prefix.trim().to_string())
            .filter(|prefix| !prefix.is_empty())
            .collect(),
        None => defaults.excluded_prefixes,
    };
    if let Some(prefix) = excluded_prefixes.iter().find(|p| !p.starts_with('/')) {
        return Err(LoadError::invalid(
            "cache.excluded_prefixes",
            format!("prefix `{prefix}` must start with `/`"),
        ));
    }

    let namespace = cache
        .namespace
        .map(|value| value.trim().to_string())
        .unwrap_or(defaults.namespace);
    if namespace.is_empty() || namespace.contains(['*', '?', '[', ']', ':']) {
        return Err(LoadError::invalid(
            "cache.namespace",
            "namespace must be non-empty and free of `:` and glob characters",
        ));
    }

    let max_body_bytes = non_zero_usize(
        cache
            .max_body_bytes
            .unwrap_or(defaults.max_body_bytes as u64),
        "cache.max_body_bytes",
    )?;

    let clear_scope = match cache.clear_scope.as_deref().map(str::trim) {
        None | Some("namespace") => ClearScope::Namespace,
        Some("database") => ClearScope::Database,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.clear_scope",
                format!("unknown scope `{other}`, expected namespace or database"),
            ));
        }
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        max_age: Duration::from_secs(max_age_secs),
        excluded_prefixes,
        include_query: cache.include_query.unwrap_or(defaults.include_query),
        namespace,
        max_body_bytes,
        clear_scope,
        error_log_interval: Duration::from_secs(
            cache
                .error_log_interval_seconds
                .unwrap_or(defaults.error_log_interval_secs),
        ),
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let base_url = match upstream.base_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => {
            let url = Url::parse(value).map_err(|err| {
                LoadError::invalid("upstream.base_url", format!("failed to parse: {err}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "upstream.base_url",
                    "scheme must be http or https",
                ));
            }
            Some(url)
        }
    };

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    database: Option<u32>,
    connect_timeout_ms: Option<u64>,
    command_timeout_ms: Option<u64>,
    reconnect_attempts: Option<u64>,
    failure_threshold: Option<u64>,
    cooldown_seconds: Option<u64>,
    memory_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    max_age_seconds: Option<u64>,
    excluded_prefixes: Option<Vec<String>>,
    include_query: Option<bool>,
    namespace: Option<String>,
    max_body_bytes: Option<u64>,
    clear_scope: Option<String>,
    error_log_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
