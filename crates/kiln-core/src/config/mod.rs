//! Configuration system for Kiln

mod cache;
pub mod defaults;
mod loader;
mod types;
pub mod validation;

pub use cache::*;
pub use defaults::*;
pub use loader::*;
pub use types::*;
pub use validation::*;
