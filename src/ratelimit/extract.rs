//! Deriving the caller identity a request is limited by.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::KeyBy;
use crate::error::{Result, TurnstileError};

/// Key used when a request carries no usable identity.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// Header read for API keys when none is configured.
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

const FORWARDED_FOR: &str = "x-forwarded-for";
const AUTHORIZATION: &str = "authorization";

/// The parts of an inbound request a key can be derived from.
///
/// Header names are case-insensitive and stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    remote_addr: Option<IpAddr>,
    headers: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// User supplied key derivation for [`KeyBy::Custom`].
pub type CustomKeyFn = Arc<dyn Fn(&RequestInfo) -> Option<String> + Send + Sync>;

/// Turns a [`RequestInfo`] into the user key passed to the algorithm.
#[derive(Clone)]
pub struct KeyExtractor {
    key_by: KeyBy,
    header: String,
    custom: Option<CustomKeyFn>,
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExtractor")
            .field("key_by", &self.key_by)
            .field("header", &self.header)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl KeyExtractor {
    /// Fails with `ConfigInvalid` when `key_by` is custom but no function is given.
    pub fn new(key_by: KeyBy, header_key: Option<&str>, custom: Option<CustomKeyFn>) -> Result<Self> {
        if key_by == KeyBy::Custom && custom.is_none() {
            return Err(TurnstileError::ConfigInvalid(
                "key_by is custom but no key extractor was provided".to_string(),
            ));
        }

        let header = header_key
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_API_KEY_HEADER)
            .to_ascii_lowercase();

        Ok(Self {
            key_by,
            header,
            custom,
        })
    }

    pub fn key_by(&self) -> KeyBy {
        self.key_by
    }

    /// Derive the user key, or [`ANONYMOUS_KEY`] if the request has none.
    pub fn extract(&self, request: &RequestInfo) -> String {
        let key = match self.key_by {
            KeyBy::Ip => client_ip(request),
            KeyBy::ApiKey => request.header(&self.header).map(str::to_string),
            KeyBy::Token => bearer_token(request),
            KeyBy::Custom => self.custom.as_ref().and_then(|custom| custom(request)),
        };

        key.map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| ANONYMOUS_KEY.to_string())
    }
}

/// The peer address, or the first hop of `X-Forwarded-For` when unknown.
fn client_ip(request: &RequestInfo) -> Option<String> {
    if let Some(addr) = request.remote_addr() {
        return Some(addr.to_string());
    }
    request
        .header(FORWARDED_FOR)
        .and_then(|chain| chain.split(',').next())
        .map(str::to_string)
}

fn bearer_token(request: &RequestInfo) -> Option<String> {
    let value = request.header(AUTHORIZATION)?.trim();
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => Some(token.to_string()),
        Some(_) => None,
        None => Some(value.to_string()),
    }
}
