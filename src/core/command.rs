//! rsync 命令构建 - 从同步配置到参数向量的纯映射

use crate::db::models::{DeletionPolicy, SyncMode, SyncProfile};
use std::path::{Path, PathBuf};

/// 一条可执行的 rsync 命令
#[derive(Debug, Clone)]
pub struct RsyncCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// 已归一化（保证尾部斜杠）的源路径
    pub source: String,
    /// 已归一化的目标路径
    pub destination: String,
}

impl RsyncCommand {
    /// 完整参数列表：选项 + 源 + 目标
    pub fn all_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(self.source.clone());
        args.push(self.destination.clone());
        args
    }

    /// 控制台回显用的命令行文本
    pub fn display_line(&self) -> String {
        format!("{} {}", self.program.display(), self.all_args().join(" "))
    }
}

/// 命令构建器：对同一配置和可执行路径，输出是确定的
pub struct CommandBuilder<'a> {
    profile: &'a SyncProfile,
    program: &'a Path,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(profile: &'a SyncProfile, program: &'a Path) -> Self {
        Self { profile, program }
    }

    /// 预览命令：dry-run + itemize，不启用压缩（dry-run 下只增加开销）
    pub fn build_preview(&self) -> RsyncCommand {
        let mut args = vec!["-av".to_string(), "--human-readable".to_string()];
        args.push("--dry-run".to_string());
        args.push("--itemize-changes".to_string());
        args.extend(self.mode_flags());
        args.extend(self.deletion_flags());
        args.extend(self.profile.filters.rsync_flags());
        args.extend(self.profile.extra_flags.iter().cloned());

        self.finish(args)
    }

    /// 实际同步命令：带断点目录和总体进度输出
    pub fn build_sync(&self) -> RsyncCommand {
        let mut args = self.base_flags();
        args.push("--partial-dir=.syncpilot_partial".to_string());
        args.push("--info=progress2".to_string());
        args.extend(self.mode_flags());
        args.extend(self.deletion_flags());
        args.extend(self.profile.filters.rsync_flags());
        args.extend(self.profile.extra_flags.iter().cloned());

        self.finish(args)
    }

    /// 部分同步命令：只处理列表文件中的顶层条目（并行路径使用）。
    /// --files-from 与 --delete 语义互斥，这里不加模式参数。
    pub fn build_partial_sync(&self, list_file: &Path) -> RsyncCommand {
        let mut args = self.base_flags();
        args.push("--partial-dir=.syncpilot_partial".to_string());
        args.push("--info=progress2".to_string());
        args.push(format!("--files-from={}", list_file.display()));
        args.extend(self.deletion_flags());
        args.extend(self.profile.filters.rsync_flags());
        args.extend(self.profile.extra_flags.iter().cloned());

        self.finish(args)
    }

    fn base_flags(&self) -> Vec<String> {
        vec!["-avz".to_string(), "--human-readable".to_string()]
    }

    fn mode_flags(&self) -> Vec<String> {
        match self.profile.sync_mode {
            SyncMode::Mirror => vec!["--delete".to_string(), "--delete-during".to_string()],
            SyncMode::Update => vec!["--update".to_string()],
            // 双向同步由调用方跑两个单向 pass，这里不加参数
            SyncMode::Synchronize => Vec::new(),
        }
    }

    fn deletion_flags(&self) -> Vec<String> {
        match &self.profile.deletion_policy {
            DeletionPolicy::Permanent => Vec::new(),
            DeletionPolicy::Trash => {
                // 回收目录由配置 id 派生，同一配置的输出保持确定
                let backup_dir = std::env::temp_dir()
                    .join(format!("syncpilot_trash_{}", self.profile.id));
                vec![
                    "--backup".to_string(),
                    format!("--backup-dir={}", backup_dir.display()),
                ]
            }
            DeletionPolicy::Versioning { path } => vec![
                "--backup".to_string(),
                format!("--backup-dir={}", path),
            ],
        }
    }

    fn finish(&self, args: Vec<String>) -> RsyncCommand {
        RsyncCommand {
            program: self.program.to_path_buf(),
            args,
            source: ensure_trailing_slash(&self.profile.source_path),
            destination: ensure_trailing_slash(&self.profile.destination_path),
        }
    }
}

fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::FilterConfig;

    fn profile() -> SyncProfile {
        let mut p = SyncProfile::new("测试", "/data/src", "/data/dst/");
        p.filters = FilterConfig {
            include_patterns: vec![],
            exclude_patterns: vec![".DS_Store".to_string()],
        };
        p
    }

    fn builder_args(p: &SyncProfile, f: impl Fn(&CommandBuilder) -> RsyncCommand) -> Vec<String> {
        let program = PathBuf::from("/usr/bin/rsync");
        f(&CommandBuilder::new(p, &program)).all_args()
    }

    #[test]
    fn test_preview_is_dry_run_without_compression() {
        let p = profile();
        let args = builder_args(&p, |b| b.build_preview());

        assert!(args.contains(&"--dry-run".to_string()));
        assert!(args.contains(&"--itemize-changes".to_string()));
        assert!(args.contains(&"-av".to_string()));
        assert!(!args.contains(&"-avz".to_string()));
    }

    #[test]
    fn test_trailing_slash_normalization() {
        let p = profile();
        let program = PathBuf::from("/usr/bin/rsync");
        let cmd = CommandBuilder::new(&p, &program).build_sync();
        assert_eq!(cmd.source, "/data/src/");
        assert_eq!(cmd.destination, "/data/dst/");
        // 源和目标永远在参数末尾
        let args = cmd.all_args();
        assert_eq!(&args[args.len() - 2..], ["/data/src/", "/data/dst/"]);
    }

    #[test]
    fn test_mode_flags() {
        let mut p = profile();

        p.sync_mode = SyncMode::Mirror;
        let args = builder_args(&p, |b| b.build_sync());
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--delete-during".to_string()));

        p.sync_mode = SyncMode::Update;
        let args = builder_args(&p, |b| b.build_sync());
        assert!(args.contains(&"--update".to_string()));
        assert!(!args.contains(&"--delete".to_string()));

        p.sync_mode = SyncMode::Synchronize;
        let args = builder_args(&p, |b| b.build_sync());
        assert!(!args.contains(&"--update".to_string()));
        assert!(!args.contains(&"--delete".to_string()));
    }

    #[test]
    fn test_deletion_policy_flags() {
        let mut p = profile();

        p.deletion_policy = DeletionPolicy::Permanent;
        let args = builder_args(&p, |b| b.build_sync());
        assert!(!args.iter().any(|a| a.starts_with("--backup")));

        p.deletion_policy = DeletionPolicy::Versioning {
            path: "/backups/v1".to_string(),
        };
        let args = builder_args(&p, |b| b.build_sync());
        assert!(args.contains(&"--backup".to_string()));
        assert!(args.contains(&"--backup-dir=/backups/v1".to_string()));

        p.deletion_policy = DeletionPolicy::Trash;
        let args = builder_args(&p, |b| b.build_sync());
        assert!(args.contains(&"--backup".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--backup-dir=") && a.contains("syncpilot_trash_")));
    }

    #[test]
    fn test_partial_sync_uses_files_from_without_mode_flags() {
        let mut p = profile();
        p.sync_mode = SyncMode::Mirror;
        let list = PathBuf::from("/tmp/syncpilot_files_x.txt");
        let program = PathBuf::from("/usr/bin/rsync");
        let args = CommandBuilder::new(&p, &program)
            .build_partial_sync(&list)
            .all_args();

        assert!(args.contains(&"--files-from=/tmp/syncpilot_files_x.txt".to_string()));
        assert!(!args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--info=progress2".to_string()));
    }

    #[test]
    fn test_filters_and_extra_flags_in_order() {
        let mut p = profile();
        p.filters.include_patterns = vec!["*.rs".to_string()];
        p.extra_flags = vec!["--bwlimit=1000".to_string()];
        let args = builder_args(&p, |b| b.build_sync());

        let inc = args.iter().position(|a| a == "--include").unwrap();
        assert_eq!(args[inc + 1], "*.rs");
        let exc = args.iter().position(|a| a == "--exclude").unwrap();
        assert_eq!(args[exc + 1], ".DS_Store");
        assert!(inc < exc);
        assert!(args.contains(&"--bwlimit=1000".to_string()));
    }

    #[test]
    fn test_deterministic_for_same_profile() {
        let p = profile();
        let a = builder_args(&p, |b| b.build_sync());
        let b = builder_args(&p, |b| b.build_sync());
        assert_eq!(a, b);
    }
}
