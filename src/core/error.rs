use thiserror::Error;

/// 引擎错误分类
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// 预检失败，不会启动任何子进程
    #[error("路径无法访问: {0}")]
    PathAccess(String),

    /// 子进程无法启动
    #[error("无法启动 rsync 进程: {0}")]
    Launch(String),

    /// 从错误输出推断的网络断开（调用方可据此决定重连后重试）
    #[error("网络连接已断开")]
    NetworkDisconnected,

    /// 用户取消（退出码 20 或显式 stop）
    #[error("用户已取消")]
    Cancelled,

    /// 其他非零退出，携带捕获的错误输出
    #[error("rsync 进程出错: {0}")]
    Process(String),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
