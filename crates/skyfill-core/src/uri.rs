//! Record URIs: `at://<account>/<collection>/<key>`.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

const SCHEME: &str = "at://";

/// Globally unique identifier of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(
        did: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}/{}", SCHEME, self.did, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidUri(s.to_string()))?;

        let mut parts = rest.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(did), Some(collection), Some(rkey))
                if did.starts_with("did:")
                    && !collection.is_empty()
                    && !rkey.is_empty()
                    && !rkey.contains('/') =>
            {
                Ok(Self::new(did, collection, rkey))
            }
            _ => Err(Error::InvalidUri(s.to_string())),
        }
    }
}
