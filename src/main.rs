//! syncpilot 命令行入口

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use syncpilot_lib::config::AppConfig;
use syncpilot_lib::db::models::{SyncMode, SyncProfile};
use syncpilot_lib::{logging, AppState, TaskPhase};

#[derive(Parser)]
#[command(name = "syncpilot", version, about = "基于 rsync 的目录同步工具")]
struct Cli {
    /// 配置目录（默认 ~/.config/syncpilot）
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出所有同步配置
    List,
    /// 新建或更新同步配置
    Add {
        name: String,
        source: String,
        destination: String,
        /// 同步模式：synchronize / mirror / update
        #[arg(long, default_value = "mirror")]
        mode: SyncMode,
        /// 并行子进程数
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
    /// 删除同步配置
    Remove { name: String },
    /// 对比源与目标（dry-run），打印变更列表
    Preview { name: String },
    /// 执行同步
    Sync {
        name: String,
        /// 覆盖配置中的并行子进程数
        #[arg(long)]
        threads: Option<usize>,
    },
    /// 查看同步历史
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// 清空同步历史
    ClearHistory,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => syncpilot_lib::default_config_dir()?,
    };
    std::fs::create_dir_all(&config_dir)?;
    let app_config = AppConfig::load(&config_dir);
    logging::init(&config_dir, &app_config.log)?;

    let state = AppState::init(Some(config_dir)).await?;

    match cli.command {
        Commands::List => cmd_list(&state),
        Commands::Add {
            name,
            source,
            destination,
            mode,
            threads,
        } => cmd_add(&state, name, source, destination, mode, threads),
        Commands::Remove { name } => cmd_remove(&state, &name),
        Commands::Preview { name } => cmd_preview(&state, &name).await,
        Commands::Sync { name, threads } => cmd_sync(&state, &name, threads).await,
        Commands::History { limit } => cmd_history(&state, limit).await,
        Commands::ClearHistory => {
            let removed = state.history.clear().await?;
            println!("已清空 {} 条历史记录", removed);
            Ok(())
        }
    }
}

fn cmd_list(state: &AppState) -> Result<()> {
    let profiles = state.profiles.list();
    if profiles.is_empty() {
        println!("暂无同步配置，用 `syncpilot add` 创建");
        return Ok(());
    }
    for p in profiles {
        println!(
            "{}  [{}] {} -> {}  (并行: {})",
            p.name, p.sync_mode.as_str(), p.source_path, p.destination_path, p.thread_count
        );
    }
    Ok(())
}

fn cmd_add(
    state: &AppState,
    name: String,
    source: String,
    destination: String,
    mode: SyncMode,
    threads: usize,
) -> Result<()> {
    let mut profile = match state.profiles.get_by_name(&name) {
        Some(existing) => existing,
        None => SyncProfile::new(&name, &source, &destination),
    };
    profile.source_path = source;
    profile.destination_path = destination;
    profile.sync_mode = mode;
    profile.thread_count = threads;

    state.profiles.upsert(profile)?;
    println!("已保存配置: {}", name);
    Ok(())
}

fn cmd_remove(state: &AppState, name: &str) -> Result<()> {
    let profile = find_profile(state, name)?;
    state.profiles.remove(&profile.id)?;
    println!("已删除配置: {}", name);
    Ok(())
}

async fn cmd_preview(state: &AppState, name: &str) -> Result<()> {
    let profile = find_profile(state, name)?;
    let task = state.coordinator.compare_task(profile)?;

    wait_for_preview(&task).await;
    match task.phase() {
        TaskPhase::Previewing => {
            let results = task.preview_results();
            for action in &results {
                println!("{:?}\t{}", action.action, action.relative_path);
            }
            println!("共 {} 条变更", results.len());
            state.coordinator.stop_task(&task.id)?;
            let _ = state.coordinator.remove_task(&task.id);
            Ok(())
        }
        _ => {
            let reason = task.error_message().unwrap_or_else(|| "未知错误".to_string());
            bail!("对比失败: {}", reason);
        }
    }
}

async fn cmd_sync(state: &AppState, name: &str, threads: Option<usize>) -> Result<()> {
    let mut profile = find_profile(state, name)?;
    if let Some(threads) = threads {
        profile.thread_count = threads;
    }

    let task = state.coordinator.compare_task(profile)?;
    wait_for_preview(&task).await;
    if task.phase() != TaskPhase::Previewing {
        let reason = task.error_message().unwrap_or_else(|| "未知错误".to_string());
        bail!("对比失败: {}", reason);
    }
    println!("发现 {} 条变更，开始同步", task.preview_results().len());

    state.coordinator.execute_sync_task(&task.id)?;

    // Ctrl-C 触发停止，其余时间按固定间隔刷进度
    loop {
        if task.phase().is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let p = task.progress_snapshot();
                let eta = p
                    .eta_secs()
                    .map(|s| format!("{}s", s))
                    .unwrap_or_else(|| "-".to_string());
                print!(
                    "\r{} / {} 文件  {} / {} 字节  {:.1} MB/s  剩余 {}   ",
                    p.completed_files,
                    p.total_files,
                    p.transferred_bytes,
                    p.total_bytes,
                    p.smoothed_speed / (1024.0 * 1024.0),
                    eta
                );
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n收到中断，正在停止...");
                state.coordinator.stop_task(&task.id)?;
            }
        }
    }
    println!();

    match task.phase() {
        TaskPhase::Completed => {
            let p = task.progress_snapshot();
            println!(
                "同步完成: {} 个文件，{} 字节",
                p.completed_files, p.transferred_bytes
            );
            let _ = state.coordinator.remove_task(&task.id);
            Ok(())
        }
        _ => {
            let reason = task.error_message().unwrap_or_else(|| "未知错误".to_string());
            let _ = state.coordinator.remove_task(&task.id);
            bail!("同步失败: {}", reason);
        }
    }
}

async fn cmd_history(state: &AppState, limit: u32) -> Result<()> {
    let records = state.history.load_recent(limit).await?;
    if records.is_empty() {
        println!("暂无历史记录");
        return Ok(());
    }
    for r in records {
        let status = if r.success { "成功" } else { "失败" };
        println!(
            "{}  {}  [{}]  {} 文件  {} 字节  {}",
            format_time(r.end_time),
            r.profile_name,
            r.sync_mode.as_str(),
            r.files_transferred,
            r.bytes_transferred,
            status
        );
    }
    Ok(())
}

fn find_profile(state: &AppState, name: &str) -> Result<SyncProfile> {
    state
        .profiles
        .get_by_name(name)
        .with_context(|| format!("配置不存在: {}", name))
}

/// 等任务离开对比阶段（进入预览或终态）
async fn wait_for_preview(task: &std::sync::Arc<syncpilot_lib::core::SyncTask>) {
    loop {
        let phase = task.phase();
        if phase != TaskPhase::Idle && phase != TaskPhase::Comparing {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}
