pub mod config;
pub mod error;
pub mod flow;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ParleyError, Result};
pub use flow::{Edge, Flow, FlowDocument, Node, NodeKind};
pub use state::{ConversationState, NodeStatus, TurnRecord, TurnStatus};
pub use types::*;
