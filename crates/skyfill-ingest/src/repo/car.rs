//! CAR v1 repository decoder.
//!
//! # Layout
//!
//! ```text
//! varint(len) | DAG-CBOR header { version: 1, roots: [commit] }
//! varint(len) | CID | block bytes
//! varint(len) | CID | block bytes
//! ...
//! ```
//!
//! The root commit's `data` field points at a Merkle search tree (MST) whose
//! leaves map `collection/rkey` keys to record blocks. Each MST node is
//!
//! ```text
//! { l: CID | null, e: [ { p: prefix_len, k: key_suffix, v: record CID, t: CID | null } ] }
//! ```
//!
//! where entry keys are prefix-compressed against the previous entry in the
//! same node, `l` holds keys below the first entry and each `t` holds keys
//! between its entry and the next. Walking `l`, then each entry followed by
//! its `t`, yields records in key order.

use super::{RecordIter, RepoRecord, SnapshotDecoder};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use bytes::Bytes;
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::Range;

/// Decoder for `com.atproto.sync.getRepo` CAR files.
#[derive(Debug, Clone, Copy, Default)]
pub struct CarDecoder;

impl SnapshotDecoder for CarDecoder {
    fn decode(&self, snapshot: Bytes) -> Result<RecordIter> {
        let car = CarIndex::parse(snapshot)?;
        let commit = car.ipld(&car.root)?;
        let data = match commit {
            Ipld::Map(ref fields) => match fields.get("data") {
                Some(Ipld::Link(cid)) => *cid,
                _ => return Err(Error::Decode("commit has no data link".to_string())),
            },
            _ => return Err(Error::Decode("commit block is not a map".to_string())),
        };

        Ok(Box::new(CarRecords {
            car,
            stack: vec![Frame::Node(data)],
        }))
    }
}

/// Block offsets within one CAR file.
struct CarIndex {
    data: Bytes,
    root: Cid,
    blocks: HashMap<Cid, Range<usize>>,
}

impl CarIndex {
    fn parse(data: Bytes) -> Result<Self> {
        let mut pos = 0;

        let header_range = read_section(&data, &mut pos)?;
        let header: Ipld = serde_ipld_dagcbor::from_slice(&data[header_range])
            .map_err(|e| Error::Decode(format!("CAR header: {e}")))?;
        let root = match &header {
            Ipld::Map(fields) => match fields.get("roots") {
                Some(Ipld::List(roots)) => match roots.first() {
                    Some(Ipld::Link(cid)) => *cid,
                    _ => return Err(Error::Decode("CAR header has no roots".to_string())),
                },
                _ => return Err(Error::Decode("CAR header has no roots".to_string())),
            },
            _ => return Err(Error::Decode("CAR header is not a map".to_string())),
        };

        let mut blocks = HashMap::new();
        while pos < data.len() {
            let section = read_section(&data, &mut pos)?;
            let mut cursor = Cursor::new(&data[section.clone()]);
            let cid = Cid::read_bytes(&mut cursor)
                .map_err(|e| Error::Decode(format!("block CID at offset {}: {e}", section.start)))?;
            let body_start = section.start + cursor.position() as usize;
            blocks.insert(cid, body_start..section.end);
        }

        Ok(Self { data, root, blocks })
    }

    fn ipld(&self, cid: &Cid) -> Result<Ipld> {
        let range = self
            .blocks
            .get(cid)
            .ok_or_else(|| Error::Decode(format!("missing block {cid}")))?;
        serde_ipld_dagcbor::from_slice(&self.data[range.clone()])
            .map_err(|e| Error::Decode(format!("block {cid}: {e}")))
    }
}

enum Frame {
    Node(Cid),
    Leaf { key: String, cid: Cid },
}

struct CarRecords {
    car: CarIndex,
    stack: Vec<Frame>,
}

impl Iterator for CarRecords {
    type Item = Result<RepoRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Node(cid) => {
                    if let Err(e) = self.expand(&cid) {
                        return Some(Err(e));
                    }
                }
                Frame::Leaf { key, cid } => return Some(self.record(&key, &cid)),
            }
        }
        None
    }
}

impl CarRecords {
    /// Push a node's children so they pop in key order.
    fn expand(&mut self, cid: &Cid) -> Result<()> {
        let Ipld::Map(mut node) = self.car.ipld(cid)? else {
            return Err(Error::Decode(format!("MST node {cid} is not a map")));
        };

        let left = optional_link(node.remove("l"));
        let entries = match node.remove("e") {
            Some(Ipld::List(entries)) => entries,
            _ => return Err(Error::Decode(format!("MST node {cid} has no entries"))),
        };

        let mut frames = Vec::with_capacity(entries.len() * 2);
        let mut prev_key: Vec<u8> = Vec::new();
        for entry in entries {
            let Ipld::Map(mut entry) = entry else {
                return Err(Error::Decode(format!("MST node {cid} has a malformed entry")));
            };
            let prefix = match entry.remove("p") {
                Some(Ipld::Integer(p)) => usize::try_from(p).ok(),
                _ => None,
            };
            let (Some(prefix), Some(Ipld::Bytes(suffix)), Some(Ipld::Link(value))) =
                (prefix, entry.remove("k"), entry.remove("v"))
            else {
                return Err(Error::Decode(format!("MST node {cid} has a malformed entry")));
            };
            if prefix > prev_key.len() {
                return Err(Error::Decode(format!(
                    "MST node {cid}: prefix {prefix} longer than previous key"
                )));
            }

            prev_key.truncate(prefix);
            prev_key.extend_from_slice(&suffix);
            let key = String::from_utf8(prev_key.clone())
                .map_err(|_| Error::Decode(format!("MST node {cid}: key is not UTF-8")))?;

            frames.push(Frame::Leaf { key, cid: value });
            if let Some(tree) = optional_link(entry.remove("t")) {
                frames.push(Frame::Node(tree));
            }
        }

        self.stack.extend(frames.into_iter().rev());
        if let Some(left) = left {
            self.stack.push(Frame::Node(left));
        }
        Ok(())
    }

    fn record(&self, key: &str, cid: &Cid) -> Result<RepoRecord> {
        let (collection, rkey) = key
            .split_once('/')
            .filter(|(c, r)| !c.is_empty() && !r.is_empty())
            .ok_or_else(|| Error::Decode(format!("malformed record key {key}")))?;

        let body = self.car.ipld(cid)?;
        Ok(RepoRecord {
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            cid: *cid,
            record: ipld_to_json(body),
        })
    }
}

fn optional_link(value: Option<Ipld>) -> Option<Cid> {
    match value {
        Some(Ipld::Link(cid)) => Some(cid),
        _ => None,
    }
}

/// Read one varint-length-prefixed section, returning its byte range.
fn read_section(data: &[u8], pos: &mut usize) -> Result<Range<usize>> {
    let len = read_varint(data, pos)?;
    let start = *pos;
    let end = usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::Decode(format!("truncated section at offset {start}")))?;
    *pos = end;
    Ok(start..end)
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    for shift in (0..64).step_by(7) {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| Error::Decode(format!("truncated varint at offset {}", *pos)))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Decode("varint overflow".to_string()))
}

/// Render a decoded block as DAG-JSON.
fn ipld_to_json(ipld: Ipld) -> serde_json::Value {
    use serde_json::Value;

    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => i64::try_from(i)
            .map(Value::from)
            .or_else(|_| u64::try_from(i).map(Value::from))
            .unwrap_or_else(|_| Value::String(i.to_string())),
        Ipld::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s),
        Ipld::Bytes(b) => serde_json::json!({ "$bytes": STANDARD_NO_PAD.encode(b) }),
        Ipld::List(items) => Value::Array(items.into_iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, ipld_to_json(v)))
                .collect::<serde_json::Map<_, _>>(),
        ),
        Ipld::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipld_core::cid::multihash::Multihash;
    use serde_json::json;
    use std::collections::BTreeMap;

    const DAG_CBOR: u64 = 0x71;
    const SHA2_256: u64 = 0x12;

    fn fake_cid(n: u8) -> Cid {
        Cid::new_v1(DAG_CBOR, Multihash::<64>::wrap(SHA2_256, &[n; 32]).unwrap())
    }

    fn ipld_map(pairs: Vec<(&str, Ipld)>) -> Ipld {
        Ipld::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn write_varint(out: &mut Vec<u8>, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    struct CarBuilder {
        out: Vec<u8>,
    }

    impl CarBuilder {
        fn new(root: Cid) -> Self {
            let header = ipld_map(vec![
                ("version", Ipld::Integer(1)),
                ("roots", Ipld::List(vec![Ipld::Link(root)])),
            ]);
            let header = serde_ipld_dagcbor::to_vec(&header).unwrap();
            let mut out = Vec::new();
            write_varint(&mut out, header.len() as u64);
            out.extend_from_slice(&header);
            Self { out }
        }

        fn block(mut self, cid: Cid, value: &Ipld) -> Self {
            let body = serde_ipld_dagcbor::to_vec(value).unwrap();
            let cid_bytes = cid.to_bytes();
            write_varint(&mut self.out, (cid_bytes.len() + body.len()) as u64);
            self.out.extend_from_slice(&cid_bytes);
            self.out.extend_from_slice(&body);
            self
        }

        fn build(self) -> Bytes {
            Bytes::from(self.out)
        }
    }

    fn entry(prefix: i128, suffix: &str, value: Cid, tree: Option<Cid>) -> Ipld {
        ipld_map(vec![
            ("p", Ipld::Integer(prefix)),
            ("k", Ipld::Bytes(suffix.as_bytes().to_vec())),
            ("v", Ipld::Link(value)),
            ("t", tree.map(Ipld::Link).unwrap_or(Ipld::Null)),
        ])
    }

    fn node(left: Option<Cid>, entries: Vec<Ipld>) -> Ipld {
        ipld_map(vec![
            ("l", left.map(Ipld::Link).unwrap_or(Ipld::Null)),
            ("e", Ipld::List(entries)),
        ])
    }

    fn record(text: &str) -> Ipld {
        ipld_map(vec![
            ("$type", Ipld::String("app.bsky.feed.post".to_string())),
            ("text", Ipld::String(text.to_string())),
        ])
    }

    /// Four records spread over a root node with a left subtree and a
    /// right subtree.
    fn sample_car(skip_block: Option<Cid>) -> Bytes {
        let (commit, root, left, right) = (fake_cid(1), fake_cid(2), fake_cid(3), fake_cid(4));
        let (r1, r2, r3, r4) = (fake_cid(11), fake_cid(12), fake_cid(13), fake_cid(14));

        let blocks = vec![
            (
                commit,
                ipld_map(vec![
                    ("did", Ipld::String("did:plc:abc".to_string())),
                    ("version", Ipld::Integer(3)),
                    ("data", Ipld::Link(root)),
                    ("rev", Ipld::String("3kabc".to_string())),
                    ("prev", Ipld::Null),
                    ("sig", Ipld::Bytes(vec![0; 64])),
                ]),
            ),
            (
                root,
                node(
                    Some(left),
                    vec![
                        entry(0, "app.bsky.feed.post/3bbb", r2, Some(right)),
                        entry(19, "3ddd", r4, None),
                    ],
                ),
            ),
            (left, node(None, vec![entry(0, "app.bsky.feed.like/3aaa", r1, None)])),
            (right, node(None, vec![entry(0, "app.bsky.feed.post/3ccc", r3, None)])),
            (
                r1,
                ipld_map(vec![
                    ("subject", ipld_map(vec![("cid", Ipld::Link(r2))])),
                    ("createdAt", Ipld::String("2020-01-01T00:00:00Z".to_string())),
                ]),
            ),
            (r2, record("second")),
            (r3, record("third")),
            (r4, record("fourth")),
        ];

        let mut builder = CarBuilder::new(commit);
        for (cid, value) in &blocks {
            if Some(*cid) != skip_block {
                builder = builder.block(*cid, value);
            }
        }
        builder.build()
    }

    #[test]
    fn test_records_in_key_order() {
        let records: Vec<RepoRecord> = CarDecoder
            .decode(sample_car(None))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        let keys: Vec<String> = records
            .iter()
            .map(|r| format!("{}/{}", r.collection, r.rkey))
            .collect();
        assert_eq!(
            keys,
            vec![
                "app.bsky.feed.like/3aaa",
                "app.bsky.feed.post/3bbb",
                "app.bsky.feed.post/3ccc",
                "app.bsky.feed.post/3ddd",
            ]
        );
        assert_eq!(records[1].cid, fake_cid(12));
        assert_eq!(records[3].record["text"], "fourth");
    }

    #[test]
    fn test_links_rendered_as_dag_json() {
        let first = CarDecoder
            .decode(sample_car(None))
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(
            first.record["subject"]["cid"],
            json!({ "$link": fake_cid(12).to_string() })
        );
        assert_eq!(first.record["createdAt"], "2020-01-01T00:00:00Z");
    }

    #[test]
    fn test_missing_record_block_does_not_stop_iteration() {
        let items: Vec<Result<RepoRecord>> = CarDecoder
            .decode(sample_car(Some(fake_cid(13))))
            .unwrap()
            .collect();

        assert_eq!(items.len(), 4);
        assert!(items[2].is_err());
        assert!(items[3].is_ok());
    }

    #[test]
    fn test_missing_subtree_skips_only_that_subtree() {
        let items: Vec<Result<RepoRecord>> = CarDecoder
            .decode(sample_car(Some(fake_cid(3))))
            .unwrap()
            .collect();

        assert!(items[0].is_err());
        assert_eq!(items.iter().filter(|r| r.is_ok()).count(), 3);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(CarDecoder.decode(Bytes::from_static(b"\xff\xff")).is_err());
        assert!(CarDecoder.decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_bytes_rendered_base64() {
        assert_eq!(
            ipld_to_json(Ipld::Bytes(vec![0, 1, 2])),
            json!({ "$bytes": "AAEC" })
        );
    }

    #[test]
    fn test_varint() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        let mut pos = 0;
        assert_eq!(read_varint(&buf, &mut pos).unwrap(), 300);
        assert_eq!(pos, 2);
    }
}
