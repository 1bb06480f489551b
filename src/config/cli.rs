use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the pagehold binary.
#[derive(Debug, Parser)]
#[command(name = "pagehold", version, about = "Pagehold page cache maintenance")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PAGEHOLD_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: CacheOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Purge every cached variant of one URL.
    #[command(name = "purge-url")]
    PurgeUrl(PurgeUrlArgs),
    /// Purge every entry carrying any of the given tags.
    #[command(name = "purge-tag")]
    PurgeTag(PurgeTagArgs),
    /// Purge the whole cache.
    #[command(name = "purge-all")]
    PurgeAll,
    /// Print hit/miss counters and recent purges.
    Stats,
    /// Write the config snapshot read by the edge path.
    #[command(name = "write-snapshot")]
    WriteSnapshot(WriteSnapshotArgs),
    /// Add URLs to the preload queue.
    #[command(name = "preload-enqueue")]
    PreloadEnqueue(PreloadEnqueueArgs),
    /// Fetch a batch of queued URLs so they are cached.
    #[command(name = "preload-run")]
    PreloadRun(PreloadRunArgs),
    /// Remove expired entries from storage.
    Sweep,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeUrlArgs {
    /// Absolute URL whose entries should be dropped.
    #[arg(value_name = "URL", value_hint = ValueHint::Url)]
    pub url: String,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeTagArgs {
    #[arg(value_name = "TAG", required = true)]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct WriteSnapshotArgs {
    /// Write to this path instead of the state directory.
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct PreloadEnqueueArgs {
    #[arg(value_name = "URL", required = true, value_hint = ValueHint::Url)]
    pub urls: Vec<String>,
}

#[derive(Debug, Args, Clone, Default)]
pub struct PreloadRunArgs {
    /// Maximum number of URLs to fetch; defaults to the configured batch size.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the storage backend (disk|redis|memcached).
    #[arg(long = "cache-backend", value_name = "NAME", global = true)]
    pub cache_backend: Option<String>,

    /// Override the cache directory.
    #[arg(long = "cache-dir", value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Override the state directory (stats, purge log, preload queue, snapshot).
    #[arg(long = "cache-state-dir", value_name = "PATH", global = true)]
    pub cache_state_dir: Option<PathBuf>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL", global = true)]
    pub redis_url: Option<String>,
}
