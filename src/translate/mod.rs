//! Rewrites method bodies so running code can checkpoint itself.
//!
//! The pipeline is: infer a type for every operand-stack slot at every
//! offset ([`slots`]), re-emit each method with checkpoint, unwind, and
//! restore sequences woven in ([`mobile`]) or with a migration lock held
//! for its whole body ([`atomic`]), then stitch the rewritten members
//! into a fresh program through a symbol map ([`program`]).

mod atomic;
mod emit;
mod errors;
mod locals;
mod mobile;
mod program;
mod slots;
mod symbols;

pub use atomic::rewrite_atomic;
pub use emit::{CodeEmitter, Label, LabelMap};
pub use errors::Error;
pub use locals::LocalCache;
pub use mobile::rewrite_mobile;
pub use program::Rewriter;
pub use slots::{merge, Slot, SlotMap, SlotType};
pub use symbols::SymbolMap;
