//! 日志初始化 - tracing 输出到按大小滚动的日志文件
//!
//! 滚动策略：超过上限时把当前文件改名为 `.old` 覆盖旧备份，
//! 始终最多保留两代日志。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "syncpilot.log";
const LOG_FILE_OLD: &str = "syncpilot.log.old";

/// 日志配置（config.json 的 log 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u64 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

/// 按大小滚动的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    path: PathBuf,
    old_path: PathBuf,
    max_bytes: u64,
}

impl SizeRotatingWriter {
    pub fn new(dir: &Path, max_size_mb: u64) -> Self {
        Self {
            path: dir.join(LOG_FILE),
            old_path: dir.join(LOG_FILE_OLD),
            max_bytes: max_size_mb.max(1) * 1024 * 1024,
        }
    }

    fn rotate_if_needed(&self) {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return;
        };
        if meta.len() >= self.max_bytes {
            let _ = std::fs::rename(&self.path, &self.old_path);
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = Box<dyn Write>;

    fn make_writer(&'a self) -> Self::Writer {
        self.rotate_if_needed();
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(file) => Box::new(file),
            // 日志文件打不开时丢弃输出，不影响主流程
            Err(_) => Box::new(std::io::sink()),
        }
    }
}

/// 初始化全局日志。启用文件日志时输出到配置目录下的日志文件，
/// 否则输出到 stderr。RUST_LOG 环境变量优先于配置文件的级别。
pub fn init(config_dir: &Path, config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.level)));

    if config.enabled {
        std::fs::create_dir_all(config_dir)?;
        let writer = SizeRotatingWriter::new(config_dir, config.max_size_mb);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}
