pub mod condition;
pub mod engine;
pub mod locks;
pub mod nodes;
pub mod registry;
pub mod template;
pub mod variables;
pub mod walker;

pub use condition::{evaluate, Condition, ConditionError};
pub use engine::Engine;
pub use locks::ContactLocks;
pub use nodes::{Collaborators, EngineSettings};
pub use registry::FlowRegistry;
pub use template::{resolve, resolve_value};
pub use variables::{Lookup, Scope, VariableStore};
pub use walker::{GraphWalker, NodeReport, TurnOutcome, TurnReport};
