//! 同步核心：命令构建、输出解析、子进程管理、引擎与任务协调

pub mod command;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod parser;
pub mod process;
pub mod rsync_bin;
pub mod task;

pub use command::{CommandBuilder, RsyncCommand};
pub use coordinator::{HistorySink, TaskCoordinator};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use process::{ProcessHandle, ProcessRunner};
pub use task::{SyncTask, TaskRun};
