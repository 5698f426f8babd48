pub mod config;
pub mod node;
pub mod service_handle;
pub mod cli;

pub use config::NodeConfig;
pub use node::{Node, NodeParts};
pub use service_handle::ServiceHandle;
pub use cli::run_cli;
