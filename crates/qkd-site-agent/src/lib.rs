mod agent;
mod device;
mod error;
mod session;
mod types;

pub use agent::{SiteAgent, SiteAgentApi, SiteAgentPeer, SiteDetailsApi};
pub use device::{DeviceFactory, QkdDevice};
pub use error::SiteAgentError;
pub use session::{SessionController, SessionError};
pub use types::{LinkState, LinkStatusUpdate, SiteDetails};
