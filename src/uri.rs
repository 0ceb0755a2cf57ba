use std::{fmt, str::FromStr};

use percent_encoding::percent_decode_str;
use url::{form_urlencoded, Url};

use crate::{error::StreamError, msg::Args};

/// `scheme://service/path?key=value&...`: the host names the destination
/// service, the path names the stream on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUri {
    url: Url,
    path: String,
}

impl StreamUri {
    pub fn parse(input: &str) -> Result<Self, StreamError> {
        let url = Url::parse(input)
            .map_err(|e| StreamError::MalformedUri(format!("{}: {}", input, e)))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(StreamError::MalformedUri(format!(
                "{}: missing service name",
                input
            )));
        }
        let path = percent_decode_str(url.path())
            .decode_utf8()
            .map_err(|e| StreamError::MalformedUri(format!("{}: {}", input, e)))?
            .into_owned();
        Ok(Self { url, path })
    }

    pub fn new(service: &str, path: &str) -> Result<Self, StreamError> {
        let sep = if path.starts_with('/') { "" } else { "/" };
        Self::parse(&format!("stream://{}{}{}", service, sep, path))
    }

    /// Appends a percent-encoded argument.
    pub fn arg(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    pub fn service(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// The stream path, percent-decoded.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn args(&self) -> Result<Args, StreamError> {
        split_query(self.url.query().unwrap_or_default())
    }
}

impl FromStr for StreamUri {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StreamUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Decodes `key=value&key=value`. Every segment must carry an `=`; trailing
/// `&` separators are ignored.
pub fn split_query(query: &str) -> Result<Args, StreamError> {
    let mut args = Args::new();
    let query = query.trim_end_matches('&');
    if query.trim().is_empty() {
        return Ok(args);
    }

    for pair in query.split('&') {
        if !pair.contains('=') {
            return Err(StreamError::MalformedUri(format!(
                "query segment [{}] is not key=value",
                pair
            )));
        }
        for (key, value) in form_urlencoded::parse(pair.as_bytes()) {
            args.insert(key, value);
        }
    }
    Ok(args)
}
