//! Static rewriting and runtime support for self-checkpointing programs.
//!
//! The `image` module models programs for a small stack-based virtual
//! machine. The `translate` module rewrites method bodies so a running
//! instance can capture its own execution state at safe points and unwind
//! cooperatively. The `runtime` module holds the per-thread mobile contexts,
//! the collection they belong to, and the engine that executes images. The
//! `host` module moves a suspended computation to another process and
//! resumes it there.

pub mod host;
pub mod image;
pub mod runtime;
pub mod translate;
