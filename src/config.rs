//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const USER_ID_HEADER: &str = "x-user-id";
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_TRASH_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_ARCHIVE_TTL_SECS: u64 = 10 * 60;
pub const DEFAULT_QUOTA_RECONCILE_SECS: u64 = 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const ARCHIVE_CLEAN_INTERVAL_SECS: u64 = 60;
pub const TRASH_REAP_INTERVAL_SECS: u64 = 60 * 60;
pub const SECONDS_PER_DAY: i64 = 86_400;

/// What happens to an overwriting upload when the previous content could not
/// be snapshotted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SnapshotPolicy {
    /// Abort the overwrite; the live file stays untouched.
    #[default]
    Blocking,
    /// Log the failure and overwrite anyway.
    BestEffort,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filekeep", version = VERSION_INFO, about = "Filekeep storage server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "FILEKEEP_STORAGE_DIR",
        default_value = ".filekeep/storage",
        help = "Root of the per-user live, trash and version trees"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "FILEKEEP_ARCHIVE_DIR",
        default_value = ".filekeep/archives",
        help = "Transient directory for download archives"
    )]
    pub archive_dir: String,
    #[arg(
        short = 'd',
        long,
        env = "FILEKEEP_DATABASE_URL",
        default_value = "sqlite://.filekeep/filekeep.db",
        help = "Metadata database URL"
    )]
    pub database_url: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEKEEP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEKEEP_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "FILEKEEP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FILEKEEP_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[arg(
        long,
        env = "FILEKEEP_DEFAULT_QUOTA",
        default_value_t = DEFAULT_QUOTA_BYTES,
        help = "Quota in bytes given to newly provisioned accounts"
    )]
    pub default_quota: u64,
    #[arg(
        long,
        env = "FILEKEEP_TRASH_RETENTION_DAYS",
        default_value_t = DEFAULT_TRASH_RETENTION_DAYS,
        help = "Days a trashed item is retained"
    )]
    pub trash_retention_days: u32,
    #[arg(
        long,
        env = "FILEKEEP_TRASH_AUTO_PURGE",
        help = "Permanently purge trash records older than the retention window"
    )]
    pub trash_auto_purge: bool,
    #[arg(
        long,
        env = "FILEKEEP_ARCHIVE_TTL_SECS",
        default_value_t = DEFAULT_ARCHIVE_TTL_SECS,
        help = "Lifetime of a pending download archive in seconds"
    )]
    pub archive_ttl_secs: u64,
    #[arg(
        long,
        value_enum,
        env = "FILEKEEP_VERSION_SNAPSHOT",
        default_value_t = SnapshotPolicy::Blocking,
        help = "Whether a failed pre-overwrite snapshot blocks the upload"
    )]
    pub version_snapshot: SnapshotPolicy,
    #[arg(
        long,
        env = "FILEKEEP_QUOTA_RECONCILE_SECS",
        default_value_t = DEFAULT_QUOTA_RECONCILE_SECS,
        help = "Quota reconciliation interval in seconds (0 to disable)"
    )]
    pub quota_reconcile_secs: u64,
    #[arg(
        long,
        env = "FILEKEEP_ADMIN_IDS",
        value_delimiter = ',',
        help = "User ids allowed to change quotas"
    )]
    pub admin_ids: Vec<i64>,
}
