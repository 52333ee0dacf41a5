//! Model descriptors, generated input schemas, and the route registry.

pub mod registry;
pub mod schema;
pub mod types;

pub use registry::*;
pub use schema::*;
pub use types::*;
