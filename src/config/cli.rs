use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the readthrough binary.
#[derive(Debug, Parser)]
#[command(
    name = "readthrough",
    version,
    about = "Caching reverse proxy for content APIs"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "READTHROUGH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy and the admin listener.
    Serve(Box<ServeArgs>),
    /// Print cache statistics from the configured backend.
    Stats(BackendArgs),
    /// Remove every cached entry.
    Clear(BackendArgs),
    /// Invalidate cached entries for a resource path.
    Invalidate(InvalidateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BackendOverrides {
    /// Override the backend kind (memory|redis).
    #[arg(long = "backend-kind", value_name = "KIND")]
    pub backend_kind: Option<String>,

    /// Override the Redis host.
    #[arg(long = "backend-host", value_name = "HOST")]
    pub backend_host: Option<String>,

    /// Override the Redis port.
    #[arg(long = "backend-port", value_name = "PORT")]
    pub backend_port: Option<u16>,

    /// Override the Redis database index.
    #[arg(long = "backend-database", value_name = "INDEX")]
    pub backend_database: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BackendArgs {
    #[command(flatten)]
    pub backend: BackendOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub backend: BackendOverrides,

    /// Resource path to invalidate, e.g. `/api/products`.
    #[arg(value_name = "ROUTE")]
    pub route: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub backend: BackendOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the entry lifetime.
    #[arg(long = "cache-max-age-seconds", value_name = "SECONDS")]
    pub cache_max_age_seconds: Option<u64>,

    /// Override the upstream base URL.
    #[arg(long = "upstream-base-url", value_name = "URL")]
    pub upstream_base_url: Option<String>,
}
