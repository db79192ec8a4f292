//! SQLite 持久层 - 同步历史记录
//!
//! 连接池全局一份，建库建表由 migrations 目录管理。

pub mod models;

use crate::core::coordinator::HistorySink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use models::{CompletedTask, CompletedTaskRow};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// 打开（必要时创建）历史数据库并执行迁移
pub async fn init_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("创建数据目录失败: {}", parent.display()))?;
    }

    // Windows 路径统一成正斜杠再拼 URL
    let path_str = db_path.to_string_lossy().replace('\\', "/");
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .idle_timeout(std::time::Duration::from_secs(600))
        .connect(&url)
        .await
        .with_context(|| format!("连接数据库失败: {}", url))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("数据库迁移失败")?;

    info!("历史数据库就绪: {}", db_path.display());
    Ok(pool)
}

/// 历史记录仓库
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, task: &CompletedTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO completed_tasks
                (id, profile_name, sync_mode, start_time, end_time,
                 files_transferred, bytes_transferred, errors, success)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.profile_name)
        .bind(task.sync_mode.as_str())
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.files_transferred as i64)
        .bind(task.bytes_transferred as i64)
        .bind(task.errors as i64)
        .bind(task.success)
        .execute(&self.pool)
        .await
        .context("写入历史记录失败")?;
        Ok(())
    }

    /// 按结束时间倒序取最近的记录
    pub async fn load_recent(&self, limit: u32) -> Result<Vec<CompletedTask>> {
        let rows: Vec<CompletedTaskRow> = sqlx::query_as(
            "SELECT * FROM completed_tasks ORDER BY end_time DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("读取历史记录失败")?;

        rows.into_iter().map(CompletedTask::try_from).collect()
    }

    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM completed_tasks")
            .execute(&self.pool)
            .await
            .context("清空历史记录失败")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl HistorySink for HistoryStore {
    async fn save(&self, task: &CompletedTask) -> Result<()> {
        HistoryStore::save(self, task).await
    }
}
