//! The mobile runtime: values, contexts, collections, and the engine
//! that executes images and serves the mobility intrinsics.

mod collection;
mod context;
mod interp;
mod value;

pub use collection::{ContextCollection, CtxHandle, CtxId};
pub use context::{Invocation, MobileContext, RETURN_VALUE};
pub use interp::{Console, Engine, Fault};
pub use value::{ArrData, ArrRef, Instance, ObjRef, Value};
