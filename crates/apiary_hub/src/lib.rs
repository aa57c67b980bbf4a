mod directory;
mod hub;
mod mcp_proxy;
mod registration;
mod router;
mod service_flow;
mod task_flow;

pub use hub::Hub;
pub use router::Router;
