use crate::codec::{JSON, MSGPACK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Stamped as `from_service` on every outbound message.
    pub service_name: String,
    /// Content types this side can encode, most preferred first.
    pub codecs: Vec<String>,
}

impl Config {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: String::from("rstream-client"),
            codecs: vec![MSGPACK.to_owned(), JSON.to_owned()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_config_keeps_default_codecs() {
        let config = Config::new("orders");
        assert_eq!(config.service_name, "orders");
        assert_eq!(config.codecs, Config::default().codecs);
        assert_eq!(config.codecs[0], MSGPACK);
    }
}
