//! Caddy route representation
//!
//! The admin API models routes as loosely-typed JSON objects. Here only the
//! two handler kinds this tool creates (`reverse_proxy` and `file_server`)
//! are constructible; everything else deserializes into an opaque variant
//! that round-trips byte-for-byte, so reconciliation never corrupts routes
//! it does not own.

use crate::sites::SiteConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single request matcher inside a route's `match` array.
///
/// Only `host` is interpreted; any other matcher fields are carried through
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Matcher {
    /// Matcher for a single exact hostname
    pub fn host(domain: &str) -> Self {
        Self {
            host: Some(vec![domain.to_string()]),
            extra: Map::new(),
        }
    }
}

/// One upstream of a reverse proxy handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub dial: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Upstream {
    pub fn dial(target: &str) -> Self {
        Self {
            dial: target.to_string(),
            extra: Map::new(),
        }
    }
}

/// Request-header overrides attached to a reverse proxy handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRewrites {
    pub request: BTreeMap<String, String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseProxyHandler {
    pub upstreams: Vec<Upstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderRewrites>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileServerHandler {
    pub root: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_names: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub try_files: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The two handler kinds this tool manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum KnownHandler {
    ReverseProxy(ReverseProxyHandler),
    FileServer(FileServerHandler),
}

/// A handler entry in a route's `handle` chain.
///
/// Handlers this tool did not create (or whose shape it does not recognize)
/// fall through to `Opaque` and are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Handler {
    Known(KnownHandler),
    Opaque(Value),
}

/// One entry in a server's `routes` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(
        rename = "match",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub matchers: Option<Vec<Matcher>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handle: Vec<Handler>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Route {
    /// Build the route for a site definition.
    ///
    /// Pure construction; the caller validates the config beforehand
    /// (see `SiteConfig::validate`).
    pub fn for_site(domain: &str, config: &SiteConfig) -> Self {
        let handler = match config {
            SiteConfig::ReverseProxy {
                target_url,
                headers,
                ..
            } => KnownHandler::ReverseProxy(ReverseProxyHandler {
                upstreams: vec![Upstream::dial(target_url)],
                headers: if headers.is_empty() {
                    None
                } else {
                    Some(HeaderRewrites {
                        request: headers.clone(),
                        extra: Map::new(),
                    })
                },
                extra: Map::new(),
            }),
            SiteConfig::Static {
                root,
                index_names,
                try_files,
            } => KnownHandler::FileServer(FileServerHandler {
                root: root.clone(),
                index_names: index_names.clone(),
                try_files: try_files.clone(),
                extra: Map::new(),
            }),
        };

        Self {
            matchers: Some(vec![Matcher::host(domain)]),
            handle: vec![Handler::Known(handler)],
            terminal: Some(true),
            extra: Map::new(),
        }
    }

    /// Whether any host matcher of this route contains `domain` exactly.
    ///
    /// Comparison is exact string equality; wildcard hosts stored on the
    /// remote side are opaque strings and only match themselves.
    pub fn matches_domain(&self, domain: &str) -> bool {
        self.matchers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|m| {
                m.host
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|h| h == domain)
            })
    }

    /// Routes with no `match` at all are catch-alls, not owned by any domain
    pub fn is_catch_all(&self) -> bool {
        self.matchers.is_none()
    }
}
