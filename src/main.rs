//! teleo - tick 驱动的反应器执行内核
//!
//! 入口：加载配置、初始化日志、构建 Agent 并在阻塞线程上运行 tick 循环；
//! Ctrl+C / SIGTERM 设置终止标志，当前 tick 结束后退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use teleo::config::{load_config, ClockKind};
use teleo::core::{AgentBuilder, ShutdownManager};
use teleo::observability;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ClockArg {
    Pseudo,
    Realtime,
}

impl From<ClockArg> for ClockKind {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Pseudo => ClockKind::Pseudo,
            ClockArg::Realtime => ClockKind::Realtime,
        }
    }
}

#[derive(Parser)]
#[command(name = "teleo", about = "Tick-driven reactor execution kernel")]
struct Cli {
    /// Configuration file, layered over config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mission end tick (exclusive)
    #[arg(long)]
    final_tick: Option<u64>,

    /// Clock used to drive the mission
    #[arg(long, value_enum)]
    clock: Option<ClockArg>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone()).context("Failed to load configuration")?;
    if let Some(final_tick) = cli.final_tick {
        config.agent.final_tick = final_tick;
    }
    if let Some(clock) = cli.clock {
        config.clock.kind = clock.into();
    }

    observability::init_with_file(&config.agent.log_dir, &config.agent.name);
    tracing::info!(
        "teleo {} starting mission {} ({} reactors)",
        env!("CARGO_PKG_VERSION"),
        config.agent.name,
        config.reactors.len()
    );

    let mut agent = AgentBuilder::new(config)
        .build()
        .context("Failed to build agent")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    agent.use_shutdown_manager((*shutdown).clone());

    let (agent, result) = tokio::task::spawn_blocking(move || {
        let result = agent.run();
        (agent, result)
    })
    .await
    .context("Agent thread panicked")?;

    tracing::info!(
        "mission {} ended at tick {} of {}",
        agent.name(),
        agent.current_tick(),
        agent.final_tick()
    );
    result.context("Mission aborted")?;
    Ok(())
}
