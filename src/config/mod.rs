//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "razzo";
const DEFAULT_CACHE_ROOT: &str = "cache";
const DEFAULT_DOMAIN: &str = "localhost";
const DEFAULT_PRELOAD_CONCURRENCY: u64 = 3;
const DEFAULT_PRELOAD_INTERVAL_MS: u64 = 500;
const DEFAULT_PRELOAD_TIMEOUT_SECS: u64 = 10;
const DEFAULT_UNIT_PATH_TEMPLATE: &str = "/content/{id}/";

/// Cookie-name patterns that always force a bypass unless overridden.
const DEFAULT_REJECT_COOKIES: &[&str] =
    &["wp-postpass_", "wptouch_switch_toggle", "comment_author_"];
/// User-agent patterns that never receive cached output by default.
const DEFAULT_REJECT_UA: &[&str] = &["facebookexternalhit"];

/// Command-line arguments for the razzo binary.
#[derive(Debug, Parser)]
#[command(name = "razzo", version, about = "File-system HTTP page cache engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RAZZO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Remove cached entries.
    Purge(PurgeArgs),
    /// Warm the cache from a URL source.
    Preload(PreloadArgs),
    /// Report store status for the configured domain.
    Status(StatusArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Override the cache root directory.
    #[arg(long = "cache-root", value_name = "PATH")]
    pub cache_root: Option<PathBuf>,

    /// Override the cached domain.
    #[arg(long = "cache-domain", value_name = "DOMAIN")]
    pub cache_domain: Option<String>,

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
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Purge every cached entry for the domain.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub all: bool,

    /// Purge one URL and its sub-paths.
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Purge the URLs of one content unit.
    #[arg(long = "unit", value_name = "ID")]
    pub unit: Option<u64>,

    /// Purge every entry cached for one locale.
    #[arg(long = "lang", value_name = "CODE")]
    pub lang: Option<String>,

    /// Also drop the minified-asset subtree.
    #[arg(long = "minified", action = clap::ArgAction::SetTrue)]
    pub minified: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PreloadArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,

    /// Restrict the run to one locale.
    #[arg(long = "lang", value_name = "CODE")]
    pub lang: Option<String>,

    /// Override the sitemap URL used for enumeration.
    #[arg(long = "sitemap", value_name = "URL")]
    pub sitemap: Option<String>,

    /// Override the preload worker count.
    #[arg(long = "concurrency", value_name = "COUNT")]
    pub concurrency: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub overrides: CommonOverrides,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub rules: RulesSettings,
    pub cdn: CdnSettings,
    pub preload: PreloadSettings,
    pub purge: PurgeSettings,
    pub resolver: ResolverSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub root_dir: PathBuf,
    pub domain: String,
    pub enabled: bool,
    pub cache_mobile: bool,
    pub cache_ssl: bool,
}

/// Pattern lists consumed by the rule engine. Patterns are regular
/// expressions except `cache_query_strings`, which is a literal
/// parameter-name whitelist.
#[derive(Debug, Clone, Default)]
pub struct RulesSettings {
    pub reject_uri: Vec<String>,
    pub reject_cookies: Vec<String>,
    pub reject_ua: Vec<String>,
    pub cache_query_strings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CdnSettings {
    pub enabled: bool,
    pub cdn_on_ssl: bool,
    /// Zone id → ordered CNAME hosts. Zone `"all"` is the fallback.
    pub zones: HashMap<String, Vec<String>>,
    pub reject_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PreloadSettings {
    pub concurrency: NonZeroUsize,
    /// Minimum inter-request spacing per worker.
    pub interval: Duration,
    pub timeout: Duration,
    pub locales: Vec<String>,
    pub sitemap_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    /// Period for the scheduled full purge. `None` disables the schedule;
    /// entries then leave the cache only through explicit purges.
    pub cron_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Expanded with `{id}` into the canonical path of a content unit.
    pub unit_path_template: String,
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

    builder = builder.add_source(Environment::with_prefix("RAZZO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Purge(args)) => raw.apply_common_overrides(&args.overrides),
        Some(Command::Preload(args)) => raw.apply_preload_overrides(args),
        Some(Command::Status(args)) => raw.apply_common_overrides(&args.overrides),
        None => raw.apply_common_overrides(&CommonOverrides::default()),
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
    cache: RawCacheSettings,
    rules: RawRulesSettings,
    cdn: RawCdnSettings,
    preload: RawPreloadSettings,
    purge: RawPurgeSettings,
    resolver: RawResolverSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_common_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(root) = overrides.cache_root.as_ref() {
            self.cache.root_dir = Some(root.clone());
        }
        if let Some(domain) = overrides.cache_domain.as_ref() {
            self.cache.domain = Some(domain.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_preload_overrides(&mut self, args: &PreloadArgs) {
        self.apply_common_overrides(&args.overrides);
        if let Some(lang) = args.lang.as_ref() {
            self.preload.locales = Some(vec![lang.clone()]);
        }
        if let Some(sitemap) = args.sitemap.as_ref() {
            self.preload.sitemap_url = Some(sitemap.clone());
        }
        if let Some(concurrency) = args.concurrency {
            self.preload.concurrency = Some(concurrency);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            rules,
            cdn,
            preload,
            purge,
            resolver,
            logging,
        } = raw;

        let cache = build_cache_settings(cache)?;
        let rules = build_rules_settings(rules);
        let cdn = build_cdn_settings(cdn);
        let preload = build_preload_settings(preload)?;
        let purge = build_purge_settings(purge)?;
        let resolver = build_resolver_settings(resolver)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            cache,
            rules,
            cdn,
            preload,
            purge,
            resolver,
            logging,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let root_dir = cache
        .root_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_ROOT));
    if root_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.root_dir",
            "path must not be empty",
        ));
    }

    let domain = cache
        .domain
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());

    Ok(CacheSettings {
        root_dir,
        domain,
        enabled: cache.enabled.unwrap_or(true),
        cache_mobile: cache.cache_mobile.unwrap_or(false),
        cache_ssl: cache.cache_ssl.unwrap_or(true),
    })
}

fn build_rules_settings(rules: RawRulesSettings) -> RulesSettings {
    RulesSettings {
        reject_uri: rules.reject_uri.unwrap_or_default(),
        reject_cookies: rules.reject_cookies.unwrap_or_else(|| {
            DEFAULT_REJECT_COOKIES
                .iter()
                .map(|pattern| pattern.to_string())
                .collect()
        }),
        reject_ua: rules.reject_ua.unwrap_or_else(|| {
            DEFAULT_REJECT_UA
                .iter()
                .map(|pattern| pattern.to_string())
                .collect()
        }),
        cache_query_strings: rules.cache_query_strings.unwrap_or_default(),
    }
}

fn build_cdn_settings(cdn: RawCdnSettings) -> CdnSettings {
    CdnSettings {
        enabled: cdn.enabled.unwrap_or(false),
        cdn_on_ssl: cdn.cdn_on_ssl.unwrap_or(false),
        zones: cdn.zones.unwrap_or_default(),
        reject_files: cdn.reject_files.unwrap_or_default(),
    }
}

fn build_preload_settings(preload: RawPreloadSettings) -> Result<PreloadSettings, LoadError> {
    let concurrency = non_zero_usize(
        preload.concurrency.unwrap_or(DEFAULT_PRELOAD_CONCURRENCY),
        "preload.concurrency",
    )?;

    let interval = Duration::from_millis(
        preload.interval_ms.unwrap_or(DEFAULT_PRELOAD_INTERVAL_MS),
    );

    let timeout_secs = preload
        .timeout_seconds
        .unwrap_or(DEFAULT_PRELOAD_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "preload.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let sitemap_url = preload.sitemap_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(PreloadSettings {
        concurrency,
        interval,
        timeout: Duration::from_secs(timeout_secs),
        locales: preload.locales.unwrap_or_default(),
        sitemap_url,
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let cron_interval = match purge.cron_interval_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "purge.cron_interval_seconds",
                "must be greater than zero; omit to disable the schedule",
            ));
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };
    Ok(PurgeSettings { cron_interval })
}

fn build_resolver_settings(resolver: RawResolverSettings) -> Result<ResolverSettings, LoadError> {
    let unit_path_template = resolver
        .unit_path_template
        .unwrap_or_else(|| DEFAULT_UNIT_PATH_TEMPLATE.to_string());
    if !unit_path_template.contains("{id}") {
        return Err(LoadError::invalid(
            "resolver.unit_path_template",
            "template must contain `{id}`",
        ));
    }

    Ok(ResolverSettings { unit_path_template })
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

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    root_dir: Option<PathBuf>,
    domain: Option<String>,
    enabled: Option<bool>,
    cache_mobile: Option<bool>,
    cache_ssl: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRulesSettings {
    reject_uri: Option<Vec<String>>,
    reject_cookies: Option<Vec<String>>,
    reject_ua: Option<Vec<String>>,
    cache_query_strings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCdnSettings {
    enabled: Option<bool>,
    cdn_on_ssl: Option<bool>,
    zones: Option<HashMap<String, Vec<String>>>,
    reject_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreloadSettings {
    concurrency: Option<u64>,
    interval_ms: Option<u64>,
    timeout_seconds: Option<u64>,
    locales: Option<Vec<String>>,
    sitemap_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    cron_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResolverSettings {
    unit_path_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
