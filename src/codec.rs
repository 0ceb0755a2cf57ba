use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

pub const MSGPACK: &str = "application/msgpack";
pub const JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub payload: Bytes,
    pub content_type: String,
}

/// The content types one side of a channel can produce, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codecs {
    content_types: Vec<String>,
}

impl Codecs {
    pub fn new(content_types: Vec<String>) -> Self {
        Self { content_types }
    }

    pub fn content_types(&self) -> &[String] {
        &self.content_types
    }

    pub fn supports(content_type: &str) -> bool {
        matches!(content_type, MSGPACK | JSON)
    }

    /// Encodes `value` with the first local codec the remote side accepts.
    /// An empty `remote` list means the remote side did not advertise any
    /// preference, in which case the local favourite wins.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T, remote: &[String]) -> Result<Encoded> {
        let content_type = self.select(remote)?;
        let payload = match content_type {
            MSGPACK => rmp_serde::to_vec_named(value)?,
            JSON => serde_json::to_vec(value)?,
            other => bail!("unsupported content type {}", other),
        };
        Ok(Encoded {
            payload: payload.into(),
            content_type: content_type.to_owned(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8], content_type: &str) -> Result<T> {
        let value = match content_type {
            MSGPACK => rmp_serde::from_slice(payload)?,
            JSON => serde_json::from_slice(payload)?,
            other => bail!("unsupported content type {}", other),
        };
        Ok(value)
    }

    fn select(&self, remote: &[String]) -> Result<&str> {
        self.content_types
            .iter()
            .filter(|ct| Self::supports(ct))
            .find(|ct| remote.is_empty() || remote.contains(ct))
            .map(String::as_str)
            .ok_or_else(|| {
                anyhow!(
                    "no common codec: local {:?}, remote {:?}",
                    self.content_types,
                    remote
                )
            })
    }
}

impl Default for Codecs {
    fn default() -> Self {
        Self::new(vec![MSGPACK.to_owned(), JSON.to_owned()])
    }
}
