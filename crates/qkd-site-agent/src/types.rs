use qkd_types::SiteId;

/// Mirrors `remote::LinkStatus_State`: where a hop to a given site currently
/// stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Inactive,
    Connecting,
    Connected,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkStatusUpdate {
    pub destination: SiteId,
    pub state: LinkState,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteDetails {
    pub site: SiteId,
    pub device_ids: Vec<String>,
}
