pub mod bus;
pub mod config;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod message;

pub use bus::{HubBus, HubEvent};
pub use config::{HubConfig, McpServerConfig};
pub use correlator::Correlator;
pub use error::HubError;
pub use frame::{Frame, DEFAULT_REQUEST_TIMEOUT, HUB_VERSION};
pub use message::Message;

use serde::{Deserialize, Serialize};

/// The three kinds of peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Agent,
    Service,
    Client,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Service => "service",
            Self::Client => "client",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
