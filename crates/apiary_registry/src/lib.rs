pub mod clients;
pub mod peers;
pub mod service_tasks;
pub mod tasks;

pub use clients::{ClientRecord, ClientRegistry};
pub use peers::{PeerRecord, PeerRegistry, PeerStatus, PendingConnection};
pub use service_tasks::{NewServiceTask, ServiceTask, ServiceTaskRegistry};
pub use tasks::{AgentTask, NewAgentTask, TaskRegistry, TaskStatus, TaskUpdateEntry, UpdateDetails};
