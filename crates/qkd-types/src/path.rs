//! Physical path description for multi-hop key combination (spec §4.3, §6):
//! the ordered chain of trusted-node hops a key travels across.

use serde::{Deserialize, Serialize};

use crate::site::SiteId;

/// One QKD device on a site, identified by the site it lives on and a
/// site-local device id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub site: SiteId,
    pub device_id: String,
}

impl Endpoint {
    pub fn new(site: SiteId, device_id: impl Into<String>) -> Self {
        Self {
            site,
            device_id: device_id.into(),
        }
    }
}

/// A single hop in a physical path: the two endpoints of one detector link,
/// plus any device-specific setup parameters exchanged when the hop is
/// negotiated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HopPair {
    pub first: Option<Endpoint>,
    pub second: Option<Endpoint>,
    pub params: Vec<(String, String)>,
}

impl HopPair {
    pub fn new(first: Endpoint, second: Endpoint) -> Self {
        Self {
            first: Some(first),
            second: Some(second),
            params: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.first.is_some() && self.second.is_some()
    }
}

/// The ordered chain of hops a combined key must traverse from the
/// requesting site to the destination site.
pub type PhysicalPath = Vec<HopPair>;

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint::new(SiteId::parse(&format!("tcp://{host}:7000")).unwrap(), "dev-0")
    }

    #[test]
    fn hop_pair_reports_completeness() {
        let incomplete = HopPair::default();
        assert!(!incomplete.is_complete());

        let complete = HopPair::new(endpoint("site-a"), endpoint("site-b"));
        assert!(complete.is_complete());
    }

    #[test]
    fn physical_path_is_an_ordered_chain() {
        let path: PhysicalPath = vec![
            HopPair::new(endpoint("site-a"), endpoint("site-b")),
            HopPair::new(endpoint("site-b"), endpoint("site-c")),
        ];
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].second, path[1].first);
    }
}
