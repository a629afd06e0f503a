//! 进程输出按行切分
//!
//! `\n`、`\r`、`\r\n` 都视为行结束（进度条用 `\r` 原地刷新，这样每次刷新都是一行）；
//! 非 UTF-8 内容按有损方式解码

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::warn;

const READ_CHUNK: usize = 8 * 1024;

/// 增量行切分器
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
    prev_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段字节，返回其中完整的行
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                b'\n' if self.prev_cr => {}
                b'\n' | b'\r' => lines.push(self.take_line()),
                _ => self.pending.push(b),
            }
            self.prev_cr = b == b'\r';
        }
        lines
    }

    /// 输入结束，返回最后一行（没有换行符结尾的残留内容）
    pub fn finish(mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// 读取一个输出流，逐行送入通道；接收端关闭时提前结束
pub async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("读取进程输出失败: {}", e);
                break;
            }
        };
        for line in splitter.push(&chunk[..n]) {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        let _ = tx.send(line).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_newline_variants() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"a\nb\r\nc\rd");
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(splitter.finish().as_deref(), Some("d"));
    }

    #[test]
    fn test_split_across_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\r"), vec!["hello"]);
        // \r\n 跨块时 \n 不产生空行
        assert!(splitter.push(b"\nworld").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("world"));
    }

    #[test]
    fn test_blank_lines_kept() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"a\n\nb\n"), vec!["a", "", "b"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"ok \xff\n");
        assert_eq!(lines, vec!["ok \u{fffd}"]);
    }

    #[tokio::test]
    async fn test_pump_lines() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"one\ntwo\nthree";
        pump_lines(input, tx).await;

        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(got, vec!["one", "two", "three"]);
    }
}
