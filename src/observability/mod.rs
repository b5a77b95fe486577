//! 可观测性：控制台日志 + 每次运行追加写入的文本日志文件
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖。日志文件打不开时只输出到控制台。

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 只输出到控制台
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .try_init();
}

/// 控制台 + `<log_dir>/<agent>.log`；返回实际使用的日志文件路径
pub fn init_with_file(log_dir: &Path, agent: &str) -> Option<PathBuf> {
    let path = log_dir.join(format!("{}.log", agent));
    let file = std::fs::create_dir_all(log_dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

    match file {
        Ok(file) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init();
            tracing::info!("Logging to {}", path.display());
            Some(path)
        }
        Err(e) => {
            init();
            tracing::warn!("Cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}
