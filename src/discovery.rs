use std::collections::HashMap;

use crate::codec::{JSON, MSGPACK};

/// Tells the protocol which content types a remote service can decode.
pub trait Discovery: Send + Sync {
    fn codecs_for_service(&self, service: &str) -> Vec<String>;
}

/// Fixed service table, falling back to a default codec list for services
/// it has never heard of.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<String>>,
    fallback: Vec<String>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>, codecs: Vec<String>) -> Self {
        self.services.insert(service.into(), codecs);
        self
    }

    pub fn with_fallback(mut self, codecs: Vec<String>) -> Self {
        self.fallback = codecs;
        self
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            fallback: vec![MSGPACK.to_owned(), JSON.to_owned()],
        }
    }
}

impl Discovery for StaticDiscovery {
    fn codecs_for_service(&self, service: &str) -> Vec<String> {
        self.services
            .get(service)
            .unwrap_or(&self.fallback)
            .clone()
    }
}
