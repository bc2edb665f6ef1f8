//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const CHUNK_DIR_NAME: &str = "chunks";
pub const OBJECT_DIR_NAME: &str = "objects";
pub const CATALOG_FILE_NAME: &str = "catalog.jsonl";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_UPLOAD_MAX_SESSIONS: u64 = 64;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 900;

/// Upload pipeline limits, each disabled when set to 0.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_total_size: u64,
    pub max_chunks: u64,
    pub max_sessions: u64,
    pub session_ttl: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_total_size: DEFAULT_UPLOAD_MAX_SIZE,
            max_chunks: DEFAULT_UPLOAD_MAX_CHUNKS,
            max_sessions: DEFAULT_UPLOAD_MAX_SESSIONS,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "driftbox", version = VERSION_INFO, about = "DriftBox chunked upload depot")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "DRIFTBOX_DATA_DIR",
        default_value = ".driftbox",
        help = "Data directory (chunk buffer, object store, catalog)"
    )]
    pub data_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "DRIFTBOX_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DRIFTBOX_PORT",
        default_value_t = 5105,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "DRIFTBOX_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DRIFTBOX_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max declared upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "DRIFTBOX_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload session (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "DRIFTBOX_UPLOAD_MAX_SESSIONS",
        default_value_t = DEFAULT_UPLOAD_MAX_SESSIONS,
        help = "Max concurrent upload sessions (0 to disable)"
    )]
    pub upload_max_sessions: u64,
    #[arg(
        long,
        env = "DRIFTBOX_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Stale session eviction threshold in seconds (0 to disable)"
    )]
    pub session_ttl_secs: u64,
}

impl Args {
    /// 将命令行参数转换为上传限制配置。
    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_total_size: self.upload_max_size,
            max_chunks: self.upload_max_chunks,
            max_sessions: self.upload_max_sessions,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
        }
    }
}
