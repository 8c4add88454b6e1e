use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

/// Journal of terminal transfer outcomes. Every method has a no-op default.
pub trait Logger: Send + Sync {
    fn send_started(&self, _peer: &str, _files: usize, _bytes: Option<u64>) {}
    fn send_done(&self, _peer: &str, _bytes: u64) {}
    fn send_failed(&self, _peer: &str, _msg: &str) {}
    fn send_rejected(&self, _peer: &str) {}
    fn send_canceled(&self, _peer: &str) {}
    fn receive_done(&self, _remote: IpAddr, _sender: &str, _files: usize) {}
    fn receive_failed(&self, _remote: IpAddr, _sender: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("open journal {}", path.as_ref().display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

fn size_field(bytes: Option<u64>) -> String {
    bytes.map_or_else(|| "unknown".to_string(), |b| b.to_string())
}

impl Logger for TextLogger {
    fn send_started(&self, peer: &str, files: usize, bytes: Option<u64>) {
        self.line(&format!("SEND peer={peer} files={files} bytes={}", size_field(bytes)));
    }
    fn send_done(&self, peer: &str, bytes: u64) {
        self.line(&format!("SENT peer={peer} bytes={bytes}"));
    }
    fn send_failed(&self, peer: &str, msg: &str) {
        self.line(&format!("SEND_FAILED peer={peer} msg={msg}"));
    }
    fn send_rejected(&self, peer: &str) {
        self.line(&format!("REJECTED peer={peer}"));
    }
    fn send_canceled(&self, peer: &str) {
        self.line(&format!("CANCELED peer={peer}"));
    }
    fn receive_done(&self, remote: IpAddr, sender: &str, files: usize) {
        self.line(&format!("RECEIVED remote={remote} sender={sender} files={files}"));
    }
    fn receive_failed(&self, remote: IpAddr, sender: &str) {
        self.line(&format!("RECEIVE_FAILED remote={remote} sender={sender}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_lines_are_appended() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("logs/journal.log");
        {
            let log = TextLogger::new(&path)?;
            log.send_started("a1b2c3d4e5f6", 2, None);
            log.send_done("a1b2c3d4e5f6", 10);
        }
        TextLogger::new(&path)?.receive_failed("10.0.0.4".parse()?, "Mac");
        let text = std::fs::read_to_string(&path)?;
        let kinds: Vec<&str> = text
            .lines()
            .filter_map(|l| l.split_once("] ").map(|(_, rest)| rest.split(' ').next().unwrap_or("")))
            .collect();
        assert_eq!(kinds, vec!["SEND", "SENT", "RECEIVE_FAILED"]);
        assert!(text.contains("bytes=unknown"));
        Ok(())
    }
}
