//! Program image model: types, members, bytecode, and exception regions.

mod builder;
mod bytecode;
mod program;
mod types;

pub use builder::*;
pub use bytecode::*;
pub use program::*;
pub use types::*;
