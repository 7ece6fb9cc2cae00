//! A site's network address (spec §3, §6): a `scheme://host:port` URI with
//! both a scheme and a host required, since an agent must know how to reach
//! the peer, not just its name.

use std::fmt;

use qkd_uri::Uri;
use serde::{Deserialize, Serialize};

use crate::error::QkdError;

/// A validated site address: `tcp://host:port`, `tls://host:port`, and so on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SiteId(Uri);

impl SiteId {
    pub fn parse(input: &str) -> Result<Self, QkdError> {
        let uri = Uri::parse(input)
            .map_err(|e| QkdError::invalid_parameters(format!("invalid site address: {e}")))?;
        if uri.scheme.is_none() {
            return Err(QkdError::invalid_parameters(
                "site address is missing a scheme",
            ));
        }
        if uri.host.is_none() {
            return Err(QkdError::invalid_parameters(
                "site address is missing a host",
            ));
        }
        Ok(Self(uri))
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme.as_deref().expect("validated on construction")
    }

    pub fn host(&self) -> &str {
        self.0.host.as_deref().expect("validated on construction")
    }

    pub fn port(&self) -> u16 {
        self.0.port.unwrap_or(0)
    }

    pub fn uri(&self) -> &Uri {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for SiteId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for SiteId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SiteId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_site_address() {
        let site = SiteId::parse("tcp://site-a:7000").unwrap();
        assert_eq!(site.scheme(), "tcp");
        assert_eq!(site.host(), "site-a");
        assert_eq!(site.port(), 7000);
    }

    #[test]
    fn rejects_address_without_scheme() {
        assert!(SiteId::parse("site-a:7000").is_err());
    }

    #[test]
    fn rejects_address_without_host() {
        assert!(SiteId::parse("tcp:///just-a-path").is_err());
    }
}
