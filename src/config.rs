//! 应用配置与同步配置的持久化
//!
//! 配置目录下两个文件：`config.json` 是应用级设置（日志等），
//! `profiles.json` 是同步配置列表。都是带缩进的 JSON，便于手工修改。

use crate::db::models::SyncProfile;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

const CONFIG_FILE: &str = "config.json";
const PROFILES_FILE: &str = "profiles.json";

/// 应用级配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    /// 数据目录覆盖（历史数据库等），默认跟随配置目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

impl AppConfig {
    /// 从配置目录读取，文件缺失或损坏时回退默认值
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!("解析 {} 失败，使用默认配置: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(config_dir.join(CONFIG_FILE), text)
            .context("写入应用配置失败")?;
        Ok(())
    }
}

/// 同步配置仓库，内存列表 + JSON 文件落盘
pub struct ProfileStore {
    path: PathBuf,
    profiles: RwLock<Vec<SyncProfile>>,
}

impl ProfileStore {
    /// 从配置目录加载；profiles.json 不存在时从空列表开始
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(PROFILES_FILE);
        let profiles = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Vec<SyncProfile>>(&text)
                .with_context(|| format!("解析 {} 失败", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("读取 {} 失败", path.display())),
        };
        info!("已加载 {} 个同步配置", profiles.len());

        Ok(Self {
            path,
            profiles: RwLock::new(profiles),
        })
    }

    pub fn list(&self) -> Vec<SyncProfile> {
        self.profiles.read().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<SyncProfile> {
        self.profiles
            .read()
            .ok()?
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<SyncProfile> {
        self.profiles
            .read()
            .ok()?
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// 新增或按 id 覆盖
    pub fn upsert(&self, profile: SyncProfile) -> Result<()> {
        {
            let mut profiles = self
                .profiles
                .write()
                .map_err(|_| anyhow::anyhow!("配置列表锁中毒"))?;
            match profiles.iter_mut().find(|p| p.id == profile.id) {
                Some(existing) => *existing = profile,
                None => profiles.push(profile),
            }
        }
        self.persist()
    }

    /// 删除配置，返回是否确实存在
    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut profiles = self
                .profiles
                .write()
                .map_err(|_| anyhow::anyhow!("配置列表锁中毒"))?;
            let before = profiles.len();
            profiles.retain(|p| p.id != id);
            profiles.len() != before
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// 记录一次成功同步的完成时刻
    pub fn touch_last_synced(&self, id: &str) -> Result<()> {
        {
            let mut profiles = self
                .profiles
                .write()
                .map_err(|_| anyhow::anyhow!("配置列表锁中毒"))?;
            if let Some(profile) = profiles.iter_mut().find(|p| p.id == id) {
                profile.last_synced_at = Some(chrono::Utc::now().timestamp());
            } else {
                return Ok(());
            }
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.list();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&snapshot)?;
        // 先写临时文件再替换，避免中途断电留下半个文件
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path).context("写入同步配置失败")?;
        Ok(())
    }
}
