//! Account list input.
//!
//! The producer reads one JSON array per line:
//!
//! ```text
//! ["did:plc:abc", "https://pds.example"]
//! ```
//!
//! An optional `[start, end)` line range lets several producer processes
//! split one list between them.

use crate::Result;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// One account to crawl and the server hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountRef {
    pub did: String,
    pub server: String,
}

impl AccountRef {
    pub fn new(did: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            server: server.into(),
        }
    }
}

/// Half-open range of 0-based line numbers to read.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl LineRange {
    fn contains(&self, line: u64) -> bool {
        self.start.is_none_or(|s| line >= s) && self.end.is_none_or(|e| line < e)
    }

    fn past_end(&self, line: u64) -> bool {
        self.end.is_some_and(|e| line >= e)
    }
}

/// Parse one `["did", "server"]` line.
pub fn parse_account_line(line: &str) -> Option<AccountRef> {
    let (did, server): (String, String) = serde_json::from_str(line).ok()?;
    if did.is_empty() || server.is_empty() {
        return None;
    }
    Some(AccountRef { did, server })
}

/// Stream accounts from `path` into `tx`, returning how many were sent.
///
/// Malformed lines are logged and skipped. Stops early if the receiver is
/// dropped.
pub async fn feed_account_file(
    path: &Path,
    range: LineRange,
    tx: mpsc::Sender<AccountRef>,
) -> Result<u64> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0u64;
    let mut sent = 0u64;

    while let Some(line) = lines.next_line().await? {
        let current = line_no;
        line_no += 1;

        if range.past_end(current) {
            break;
        }
        if !range.contains(current) || line.trim().is_empty() {
            continue;
        }

        let Some(account) = parse_account_line(&line) else {
            tracing::warn!("Skipping malformed account line {}: {}", current, line);
            continue;
        };

        if tx.send(account).await.is_err() {
            tracing::debug!("Account receiver closed at line {}", current);
            break;
        }
        sent += 1;
    }

    tracing::info!("Queued {} accounts from {}", sent, path.display());
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_account_line() {
        assert_eq!(
            parse_account_line(r#"["did:plc:abc","https://pds.example"]"#),
            Some(AccountRef::new("did:plc:abc", "https://pds.example"))
        );
        assert_eq!(parse_account_line(r#"["did:plc:abc"]"#), None);
        assert_eq!(parse_account_line(r#"["", "x"]"#), None);
        assert_eq!(parse_account_line("garbage"), None);
    }

    #[tokio::test]
    async fn test_line_range_and_malformed_lines() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..6 {
            if i == 3 {
                writeln!(file, "not json").unwrap();
            } else {
                writeln!(file, r#"["did:plc:{i}","https://pds.example"]"#).unwrap();
            }
        }
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let range = LineRange {
            start: Some(1),
            end: Some(5),
        };
        let sent = feed_account_file(file.path(), range, tx).await.unwrap();
        assert_eq!(sent, 3);

        let mut dids = Vec::new();
        while let Some(account) = rx.recv().await {
            dids.push(account.did);
        }
        assert_eq!(dids, vec!["did:plc:1", "did:plc:2", "did:plc:4"]);
    }
}
