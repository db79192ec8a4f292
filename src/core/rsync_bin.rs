//! rsync 可执行文件定位

use std::path::PathBuf;
use std::process::Command;

/// 候选的固定安装位置（PATH 查不到时逐个探测）
const FALLBACK_PATHS: &[&str] = &[
    "/opt/homebrew/bin/rsync",
    "/usr/local/bin/rsync",
    "/usr/bin/rsync",
];

/// 定位 rsync 可执行文件：优先 PATH，其次常见安装位置，
/// 最后回退到系统路径（交给 spawn 时报错）
pub fn locate() -> PathBuf {
    if let Ok(path) = which::which("rsync") {
        return path;
    }

    for candidate in FALLBACK_PATHS {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return path;
        }
    }

    PathBuf::from("rsync")
}

/// 读取 rsync 版本信息的第一行，用于诊断日志
pub fn version(path: &std::path::Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines().next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_reads_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_rsync");
        std::fs::write(
            &script,
            "#!/bin/sh\nprintf 'rsync  version 9.9.9  protocol version 31\\nCopyright line\\n'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let line = version(&script).unwrap();
        assert_eq!(line, "rsync  version 9.9.9  protocol version 31");
    }

    #[test]
    fn test_version_missing_binary_is_none() {
        assert!(version(std::path::Path::new("/nonexistent/rsync-bin")).is_none());
    }
}
