//! Producer → consumer wire protocol.
//!
//! Newline-delimited UTF-8 JSON, one message per line:
//!
//! ```text
//! {"type":"commit","collection":"app.bsky.feed.post",
//!  "data":{"uri":"at://...","cid":"bafy...","timestamp":"2024-01-01T00:00:00Z","obj":{...}}}
//! ```
//!
//! `commit` is the only message type; anything else is a protocol error.

use crate::timestamp::{format_timestamp, parse_timestamp};
use crate::uri::AtUri;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};

const COMMIT_TYPE: &str = "commit";

/// One record, ready to be indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitMessage {
    pub collection: String,
    pub uri: AtUri,
    pub cid: Cid,
    pub timestamp: DateTime<Utc>,
    pub record: serde_json::Value,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    collection: &'a str,
    data: WireDataOut<'a>,
}

#[derive(Serialize)]
struct WireDataOut<'a> {
    uri: String,
    cid: String,
    timestamp: String,
    obj: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: Option<String>,
    collection: Option<String>,
    data: Option<WireDataIn>,
}

#[derive(Deserialize)]
struct WireDataIn {
    uri: Option<String>,
    cid: Option<String>,
    timestamp: Option<String>,
    obj: Option<serde_json::Value>,
}

impl CommitMessage {
    /// Serialize as one wire line, including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        let out = WireOut {
            kind: COMMIT_TYPE,
            collection: &self.collection,
            data: WireDataOut {
                uri: self.uri.to_string(),
                cid: self.cid.to_string(),
                timestamp: format_timestamp(&self.timestamp),
                obj: &self.record,
            },
        };
        let mut line = serde_json::to_string(&out)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one wire line.
    ///
    /// Rejects unknown message types and commits with a missing or empty
    /// uri, cid, timestamp or record.
    pub fn parse_line(line: &str) -> Result<Self> {
        let raw: WireIn = serde_json::from_str(line)?;

        match raw.kind.as_deref() {
            Some(COMMIT_TYPE) => {}
            other => {
                return Err(Error::InvalidMessage(format!(
                    "invalid message type {}",
                    other.unwrap_or("<missing>")
                )));
            }
        }

        let collection = raw
            .collection
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidMessage("missing collection".to_string()))?;
        let data = raw
            .data
            .ok_or_else(|| Error::InvalidMessage("missing data".to_string()))?;

        let (Some(uri), Some(cid), Some(timestamp), Some(record)) =
            (data.uri, data.cid, data.timestamp, data.obj)
        else {
            return Err(Error::InvalidMessage(format!(
                "incomplete commit data for collection {collection}"
            )));
        };
        if uri.is_empty() || cid.is_empty() || timestamp.is_empty() || record.is_null() {
            return Err(Error::InvalidMessage(format!(
                "empty commit field for {uri}"
            )));
        }

        let uri: AtUri = uri.parse()?;
        let cid = cid.parse::<Cid>().map_err(|e| Error::InvalidCid {
            cid: cid.clone(),
            reason: e.to_string(),
        })?;
        let timestamp = parse_timestamp(&timestamp)
            .ok_or_else(|| Error::InvalidMessage(format!("bad timestamp {timestamp}")))?;

        Ok(Self {
            collection,
            uri,
            cid,
            timestamp,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const CID: &str = "bafyreidfayvfuwqa7qlnopdjiqrxzs6blmoeu4rujcjtnci5beludirz2a";

    fn sample() -> CommitMessage {
        CommitMessage {
            collection: "app.bsky.feed.like".to_string(),
            uri: AtUri::new("did:plc:abc", "app.bsky.feed.like", "3jzfcijpj2z2a"),
            cid: CID.parse().unwrap(),
            timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            record: json!({ "createdAt": "2020-01-01T00:00:00Z" }),
        }
    }

    #[test]
    fn test_line_shape() {
        let line = sample().to_line().unwrap();
        assert!(line.ends_with('\n'));

        let v: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["type"], "commit");
        assert_eq!(v["collection"], "app.bsky.feed.like");
        assert_eq!(
            v["data"]["uri"],
            "at://did:plc:abc/app.bsky.feed.like/3jzfcijpj2z2a"
        );
        assert_eq!(v["data"]["cid"], CID);
        assert_eq!(v["data"]["timestamp"], "2020-01-01T00:00:00Z");
        assert_eq!(v["data"]["obj"]["createdAt"], "2020-01-01T00:00:00Z");
    }

    #[test]
    fn test_parse_written_line() {
        let msg = sample();
        let parsed = CommitMessage::parse_line(&msg.to_line().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let line = json!({ "type": "identity", "collection": "x", "data": {} }).to_string();
        let err = CommitMessage::parse_line(&line).unwrap_err();
        assert!(err.to_string().contains("invalid message type identity"));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let line = json!({
            "type": "commit",
            "collection": "app.bsky.feed.like",
            "data": { "uri": "at://did:plc:abc/app.bsky.feed.like/k", "cid": CID, "timestamp": "2020-01-01T00:00:00Z" }
        })
        .to_string();
        assert!(matches!(
            CommitMessage::parse_line(&line),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_null_record_rejected() {
        let line = json!({
            "type": "commit",
            "collection": "app.bsky.feed.like",
            "data": { "uri": "at://did:plc:abc/app.bsky.feed.like/k", "cid": CID, "timestamp": "2020-01-01T00:00:00Z", "obj": null }
        })
        .to_string();
        assert!(CommitMessage::parse_line(&line).is_err());
    }

    #[test]
    fn test_bad_cid_rejected() {
        let line = json!({
            "type": "commit",
            "collection": "app.bsky.feed.like",
            "data": { "uri": "at://did:plc:abc/app.bsky.feed.like/k", "cid": "nope", "timestamp": "2020-01-01T00:00:00Z", "obj": {} }
        })
        .to_string();
        assert!(matches!(
            CommitMessage::parse_line(&line),
            Err(Error::InvalidCid { .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            CommitMessage::parse_line("not json"),
            Err(Error::Json(_))
        ));
    }
}
