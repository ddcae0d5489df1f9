//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::level_filters::LevelFilter;

use crate::cache::{
    BucketFormat, BurstWindow, EntryStoreConfig, FailurePolicy, Layout, PayloadEncoding,
    RenderedCacheConfig,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagecache";
const ENV_PREFIX: &str = "PAGECACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_CACHE_DIRECTORY: &str = "cache/rendered";
const DEFAULT_CONTENT_TYPE: &str = "html";
const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_STORE_ROOT: &str = "cache/store";
const DEFAULT_STORE_NAMESPACE: &str = "default";
const DEFAULT_CONTENT_ROOT: &str = "public";

/// Command-line arguments for the pagecache binary.
#[derive(Debug, Parser)]
#[command(
    name = "pagecache",
    version,
    about = "Disk-backed page cache server and maintenance tool"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the content root through the rendered output cache.
    Serve(Box<ServeArgs>),
    /// Remove expired, unlocked records from an entry-store bucket.
    Sweep(SweepArgs),
    /// Remove a rendered cache version directory.
    Clear(ClearArgs),
    /// List rendered cache versions present on disk.
    Versions(VersionsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the rendered cache base directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<PathBuf>,

    /// Override the current application version.
    #[arg(long = "cache-app-version", value_name = "VERSION")]
    pub cache_app_version: Option<String>,

    /// Override the rendered cache ttl (0 means five years).
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the rendered cache layout (bundled|sidecar).
    #[arg(long = "cache-layout", value_name = "LAYOUT")]
    pub cache_layout: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the entry store root directory.
    #[arg(long = "store-root", value_name = "PATH")]
    pub store_root: Option<PathBuf>,

    /// Override the entry store namespace.
    #[arg(long = "store-namespace", value_name = "NAME")]
    pub store_namespace: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the largest response body captured into the cache.
    #[arg(long = "server-max-body-bytes", value_name = "BYTES")]
    pub server_max_body_bytes: Option<u64>,

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

    /// Override the directory served as rendered content.
    #[arg(long = "content-root", value_name = "PATH")]
    pub content_root: Option<PathBuf>,

    /// Override the runtime environment (production|development).
    #[arg(long = "environment", value_name = "ENV")]
    pub environment: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub store: StoreOverrides,

    /// Storage name of the bucket to sweep.
    #[arg(value_name = "STORAGE_NAME")]
    pub storage_name: String,
}

#[derive(Debug, Args, Clone)]
pub struct ClearArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Version directory to clear; defaults to the current version.
    #[arg(long = "target-version", value_name = "VERSION")]
    pub target_version: Option<String>,

    /// Remove a single key instead of the whole version.
    #[arg(long = "key", value_name = "KEY")]
    pub key: Option<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct VersionsArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Directory to list instead of the configured one.
    #[arg(value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub directory: Option<PathBuf>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub content: ContentSettings,
    pub environment: RuntimeEnvironment,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_body_bytes: usize,
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

/// Rendered output cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub app_version: String,
    pub historical_versions: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub content_type: String,
    pub immutable: bool,
    pub ttl_seconds: u64,
    pub burst: BurstWindow,
    pub layout: Layout,
}

impl CacheSettings {
    pub fn rendered_config(&self) -> RenderedCacheConfig {
        RenderedCacheConfig {
            directory: self.directory.clone(),
            app_version: self.app_version.clone(),
            historical_versions: self.historical_versions.clone(),
            exclude_patterns: self.exclude_patterns.clone(),
            content_type: self.content_type.clone(),
            immutable: self.immutable,
            ttl: self.ttl_seconds,
            burst: self.burst,
            layout: self.layout,
        }
    }
}

/// Entry store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub root: PathBuf,
    pub namespace: String,
    pub format: BucketFormat,
    pub encoding: PayloadEncoding,
}

impl StoreSettings {
    pub fn entry_store_config(&self, environment: RuntimeEnvironment) -> EntryStoreConfig {
        EntryStoreConfig {
            root: self.root.clone(),
            namespace: self.namespace.clone(),
            format: self.format,
            encoding: self.encoding,
            failure_policy: environment.failure_policy(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    Production,
    Development,
}

impl RuntimeEnvironment {
    /// Production keeps serving when the disk misbehaves; development surfaces it.
    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            Self::Production => FailurePolicy::Degrade,
            Self::Development => FailurePolicy::Raise,
        }
    }
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
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.historical_versions")
            .with_list_parse_key("cache.exclude_patterns")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep(args)) => raw.apply_store_overrides(&args.store),
        Some(Command::Clear(args)) => raw.apply_cache_overrides(&args.cache),
        Some(Command::Versions(args)) => raw.apply_cache_overrides(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    store: RawStoreSettings,
    content: RawContentSettings,
    environment: Option<String>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(bytes) = overrides.server_max_body_bytes {
            self.server.max_body_bytes = Some(bytes);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(root) = overrides.content_root.as_ref() {
            self.content.root = Some(root.clone());
        }
        if let Some(environment) = overrides.environment.as_ref() {
            self.environment = Some(environment.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(version) = overrides.cache_app_version.as_ref() {
            self.cache.app_version = Some(version.clone());
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }
        if let Some(layout) = overrides.cache_layout.as_ref() {
            self.cache.layout = Some(layout.clone());
        }
    }

    fn apply_store_overrides(&mut self, overrides: &StoreOverrides) {
        if let Some(root) = overrides.store_root.as_ref() {
            self.store.root = Some(root.clone());
        }
        if let Some(namespace) = overrides.store_namespace.as_ref() {
            self.store.namespace = Some(namespace.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            store,
            content,
            environment,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let store = build_store_settings(store)?;
        let content = build_content_settings(content);
        let environment = parse_environment(environment)?;

        Ok(Self {
            server,
            logging,
            cache,
            store,
            content,
            environment,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let max_body = server.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    if max_body == 0 {
        return Err(LoadError::invalid(
            "server.max_body_bytes",
            "must be greater than zero",
        ));
    }
    let max_body_bytes = usize::try_from(max_body).map_err(|_| {
        LoadError::invalid(
            "server.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_body_bytes,
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

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let app_version = non_blank(cache.app_version)
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    if app_version.contains(['/', '\\']) || app_version.contains("..") {
        return Err(LoadError::invalid(
            "cache.app_version",
            "must be a single directory name",
        ));
    }

    let content_type =
        non_blank(cache.content_type).unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let burst = match (cache.burst_seconds, non_blank(cache.burst_until)) {
        (Some(_), Some(_)) => {
            return Err(LoadError::invalid(
                "cache.burst_seconds",
                "set either burst_seconds or burst_until, not both",
            ));
        }
        (Some(0), None) | (None, None) => BurstWindow::None,
        (Some(seconds), None) => BurstWindow::For(Duration::from_secs(seconds)),
        (None, Some(until)) => {
            let instant = OffsetDateTime::parse(&until, &Rfc3339).map_err(|err| {
                LoadError::invalid("cache.burst_until", format!("expected RFC 3339: {err}"))
            })?;
            BurstWindow::Until(instant)
        }
    };

    let layout = match non_blank(cache.layout).as_deref() {
        None | Some("bundled") => Layout::Bundled,
        Some("sidecar") => Layout::Sidecar,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.layout",
                format!("unknown layout `{other}` (expected bundled|sidecar)"),
            ));
        }
    };

    Ok(CacheSettings {
        directory: cache
            .directory
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIRECTORY)),
        app_version,
        historical_versions: cache.historical_versions.unwrap_or_default(),
        exclude_patterns: cache.exclude_patterns.unwrap_or_default(),
        content_type,
        immutable: cache.immutable.unwrap_or(false),
        ttl_seconds: cache.ttl_seconds.unwrap_or(DEFAULT_TTL_SECS),
        burst,
        layout,
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let namespace =
        non_blank(store.namespace).unwrap_or_else(|| DEFAULT_STORE_NAMESPACE.to_string());

    let format = match non_blank(store.format).as_deref() {
        None | Some("json") => BucketFormat::Json,
        Some("txt") | Some("text") => BucketFormat::Text,
        Some("php") | Some("guarded") => BucketFormat::Guarded,
        Some(other) => {
            return Err(LoadError::invalid(
                "store.format",
                format!("unknown format `{other}` (expected json|txt|php)"),
            ));
        }
    };

    let encoding = match non_blank(store.encoding).as_deref() {
        None | Some("plain") => PayloadEncoding::Plain,
        Some("base64") => PayloadEncoding::Base64,
        Some(other) => {
            return Err(LoadError::invalid(
                "store.encoding",
                format!("unknown encoding `{other}` (expected plain|base64)"),
            ));
        }
    };

    Ok(StoreSettings {
        root: store
            .root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_ROOT)),
        namespace,
        format,
        encoding,
    })
}

fn build_content_settings(content: RawContentSettings) -> ContentSettings {
    ContentSettings {
        root: content
            .root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_ROOT)),
    }
}

fn parse_environment(value: Option<String>) -> Result<RuntimeEnvironment, LoadError> {
    match non_blank(value).as_deref() {
        None | Some("production") | Some("prod") => Ok(RuntimeEnvironment::Production),
        Some("development") | Some("dev") => Ok(RuntimeEnvironment::Development),
        Some(other) => Err(LoadError::invalid(
            "environment",
            format!("unknown environment `{other}` (expected production|development)"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    directory: Option<PathBuf>,
    app_version: Option<String>,
    historical_versions: Option<Vec<String>>,
    exclude_patterns: Option<Vec<String>>,
    content_type: Option<String>,
    immutable: Option<bool>,
    ttl_seconds: Option<u64>,
    burst_seconds: Option<u64>,
    burst_until: Option<String>,
    layout: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    root: Option<PathBuf>,
    namespace: Option<String>,
    format: Option<String>,
    encoding: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawContentSettings {
    root: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
