//! rsync 输出解析 - 无状态的行解析函数
//!
//! 变更行来自 `--itemize-changes`（兼容 GNU rsync 11 位与 openrsync 9 位
//! 两种标志格式），进度行来自 `--info=progress2`。残缺行在流式读取中
//! 属于正常情况，解析失败一律返回 None 而不是错误。

use crate::db::models::{ActionType, FileAction};
use regex::Regex;
use std::sync::OnceLock;

/// 删除行前缀：`*deleting   path/to/file`
const DELETE_MARKER: &str = "*deleting";

/// 解析一行 `--itemize-changes` 输出
///
/// 格式：`YXcstpoguax path`（GNU，11 位）或 `YXcstpogx path`（openrsync，9 位）。
/// 首字符决定动作：`<` 发送、`>` 接收、`c` 本地创建、`.` 属性变化或相等。
pub fn parse_itemized(line: &str) -> Option<FileAction> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix(DELETE_MARKER) {
        let path = rest.trim();
        if path.is_empty() {
            return None;
        }
        return Some(FileAction::new(path, ActionType::DeleteDest));
    }

    let space = trimmed.find(' ')?;
    let flags = &trimmed[..space];
    let path = trimmed[space + 1..].trim();

    // 两种方言的标志长度为 9-11 位，路径必须存在
    if !(9..=11).contains(&flags.len()) || path.is_empty() {
        return None;
    }

    let action = match flags.chars().next()? {
        '<' => ActionType::CopyToDest,
        '>' => ActionType::CopyToSource,
        'c' => ActionType::CopyToDest,
        '.' => {
            // 前两位之后只剩占位符或时间戳标志时视为相等，
            // 否则按内容变化处理
            let change_flags = &flags[2..];
            if change_flags
                .chars()
                .all(|c| matches!(c, '.' | ' ' | 't' | 'T'))
            {
                ActionType::Equal
            } else {
                ActionType::CopyToDest
            }
        }
        _ => return None,
    };

    Some(FileAction::new(path, action))
}

/// 一条 `--info=progress2` 进度采样
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    /// 累计传输字节数
    pub bytes: u64,
    /// 完成百分比（0-100）
    pub percent: f64,
    /// 速度（字节/秒）
    pub speed: f64,
    /// rsync 报告的剩余时间文本，如 `0:01:23`
    pub eta: String,
    /// `(xfr#N, ...)` 后缀中的已完成文件数（存在时）
    pub files_completed: Option<u64>,
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // 形如：`1,234,567  45%  12.34MB/s  0:01:23 (xfr#5, to-chk=0/10)`
        Regex::new(
            r"^\s*([\d,]+)\s+(\d+)%\s+([\d.]+)([A-Za-z]+)/s\s+(\d+:\d{2}:\d{2})(?:\s+\(xfr#(\d+)[^)]*\))?",
        )
        .expect("进度正则不合法")
    })
}

/// 解析一行 `--info=progress2` 输出，不匹配时返回 None
pub fn parse_progress(line: &str) -> Option<ProgressSample> {
    let caps = progress_regex().captures(line)?;

    let bytes: u64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let percent: f64 = caps.get(2)?.as_str().parse().ok()?;
    let value: f64 = caps.get(3)?.as_str().parse().ok()?;
    let speed = value * unit_multiplier(caps.get(4)?.as_str());
    let eta = caps.get(5)?.as_str().to_string();
    let files_completed = caps.get(6).and_then(|m| m.as_str().parse().ok());

    Some(ProgressSample {
        bytes,
        percent,
        speed,
        eta,
        files_completed,
    })
}

/// 速度单位换算（base-1024，大小写不敏感），未知单位按字节处理
fn unit_multiplier(unit: &str) -> f64 {
    match unit.to_lowercase().as_str() {
        "b" => 1.0,
        "kb" => 1024.0,
        "mb" => 1024.0 * 1024.0,
        "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

/// 按行切分的缓冲：上游以任意大小的块推入，这里只放出完整的行。
///
/// `--info=progress2` 用回车刷新同一行，所以 `\r` 与 `\n` 都作为行界。
/// 流结束时用 [`LineBuffer::flush`] 取出最后的残行。
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个块，返回其中新形成的完整行
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find(['\n', '\r']) {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// 取出末尾未换行的残行（流结束时调用一次）
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}
