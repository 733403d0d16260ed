//! Standard node library
//!
//! Built-in node types: message sources (`inject`), routing (`switch`,
//! `junction`), transformation (`change`) and sinks (`debug`, `test-once`,
//! `console-json`).

mod change;
mod de;
mod debug;
mod inject;
mod junction;
mod switch;

pub use change::{ChangeNode, ChangeNodeFactory};
pub use debug::{DebugNode, DebugNodeFactory};
pub use inject::{InjectNode, InjectNodeFactory};
pub use junction::{JunctionNode, JunctionNodeFactory};
pub use switch::{SwitchNode, SwitchNodeFactory};
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(InjectNodeFactory));
    registry.register(Arc::new(SwitchNodeFactory));
    registry.register(Arc::new(JunctionNodeFactory));
    registry.register(Arc::new(ChangeNodeFactory));
    for type_name in DebugNodeFactory::TYPES {
        registry.register(Arc::new(DebugNodeFactory::new(type_name)));
    }
}

/// Registry holding every standard node type
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
