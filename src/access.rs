//! 路径访问预检
//!
//! 同步开始前先验证源和目标可用，失败时直接报错而不是把问题留给
//! rsync 的退出码。检查走 spawn_blocking，避免网络卷上的元数据
//! 操作卡住异步运行时。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 路径在本次同步中的角色，目标路径额外要求可写
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRole {
    Source,
    Destination,
}

/// 访问检查抽象。返回 None 表示通过，Some 携带面向用户的失败原因。
#[async_trait]
pub trait PathAccessChecker: Send + Sync {
    async fn check_path_access(&self, path: &str, role: PathRole) -> Option<String>;
}

/// 基于文件系统的默认实现
pub struct FsAccessChecker;

#[async_trait]
impl PathAccessChecker for FsAccessChecker {
    async fn check_path_access(&self, path: &str, role: PathRole) -> Option<String> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || check_blocking(&path, role))
            .await
            .unwrap_or_else(|e| Some(format!("访问检查执行失败: {}", e)))
    }
}

fn check_blocking(path: &str, role: PathRole) -> Option<String> {
    if path.trim().is_empty() {
        return Some("路径为空".to_string());
    }

    let path = PathBuf::from(path);
    if !path.exists() {
        return Some(format!("路径不存在: {}", path.display()));
    }
    if !path.is_dir() {
        return Some(format!("路径不是目录: {}", path.display()));
    }

    // 读探测：能列目录才算可读
    if let Err(e) = std::fs::read_dir(&path) {
        return Some(format!("目录不可读: {} ({})", path.display(), e));
    }

    if role == PathRole::Destination {
        if let Some(msg) = probe_writable(&path) {
            return Some(msg);
        }
    }

    debug!("路径检查通过: {} ({:?})", path.display(), role);
    None
}

/// 写探测：创建再删除一个临时文件
fn probe_writable(path: &Path) -> Option<String> {
    let probe = path.join(format!(".syncpilot_probe_{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            None
        }
        Err(e) => Some(format!("目录不可写: {} ({})", path.display(), e)),
    }
}
