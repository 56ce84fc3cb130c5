use super::value::Value;
use crate::image::MethodId;
use std::collections::HashMap;

/// Property key under which a finished context records its result
pub const RETURN_VALUE: &str = "ReturnValue";

/// The entry call a context (re)plays when started
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method: MethodId,
    pub receiver: Option<Value>,
    pub args: Vec<Value>,
}

/// One migratable unit of execution
///
/// The save stack doubles as the resume-id stack: unwinding methods push
/// their live slots and their restore-point ids interleaved, and the
/// restore path pops them back in the inverse order. `nlocks` is the
/// re-entrancy counter held while handlers and atomic bodies run; it is
/// never serialized and resets to zero whenever the context leaves the
/// running state.
#[derive(Debug)]
pub struct MobileContext {
    pub save: Vec<Value>,
    pub nlocks: u32,
    pub entry: Invocation,
    pub properties: HashMap<String, Value>,
}

impl MobileContext {
    pub fn new(entry: Invocation) -> MobileContext {
        MobileContext { save: vec![], nlocks: 0, entry, properties: HashMap::new() }
    }

    /// Restored state arriving from another host
    pub fn with_saved(entry: Invocation, save: Vec<Value>) -> MobileContext {
        MobileContext { save, nlocks: 0, entry, properties: HashMap::new() }
    }
}
