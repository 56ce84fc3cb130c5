use super::context::{Invocation, MobileContext, RETURN_VALUE};
use super::interp::{Engine, Fault};
use super::value::Value;
use log::{debug, error, info};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

pub type CtxId = usize;

struct State {
    contexts: Vec<MobileContext>,
    pending: HashSet<CtxId>,
    running: HashSet<CtxId>,
    finished: HashSet<CtxId>,
    target: Option<String>,
}

/// A set of mobile contexts that migrate together
///
/// Every context id is in exactly one of pending, running, or finished.
/// All state sits behind one mutex; waits (`wait_for_all`, the restore
/// gate in `request_migration`) block on the condvar, never spin.
pub struct ContextCollection {
    state: Mutex<State>,
    cond: Condvar,
}

/// Names one context in one collection. The interpreter's mobility
/// intrinsics act through a handle, so independent collections coexist
/// in a process and none of this is thread-local.
#[derive(Clone)]
pub struct CtxHandle {
    pub coll: Arc<ContextCollection>,
    pub id: CtxId,
}

impl ContextCollection {
    pub fn new() -> ContextCollection {
        ContextCollection {
            state: Mutex::new(State {
                contexts: vec![],
                pending: HashSet::new(),
                running: HashSet::new(),
                finished: HashSet::new(),
                target: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, ctx: MobileContext) -> CtxId {
        let mut st = self.lock();
        let id = st.contexts.len();
        st.contexts.push(ctx);
        st.pending.insert(id);
        self.cond.notify_all();
        id
    }

    /// Request that the whole collection move to `target`. Blocks until
    /// no context, pending or running, is still mid-restore, then records
    /// the target; a second request while one is outstanding is ignored.
    /// A pending context arriving from a handoff counts as mid-restore
    /// until it has been started and has drained its save stack.
    pub fn request_migration(&self, target: &str) {
        let mut st = self.lock();
        while st.target.is_none() && st.contexts.iter().any(|ctx| !ctx.save.is_empty()) {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        if st.target.is_some() {
            debug!("migration target already set; ignoring {}", target);
            return;
        }
        info!("migration requested to {}", target);
        st.target = Some(target.to_owned());
        self.cond.notify_all();
    }

    pub fn is_restoring(&self, id: CtxId) -> bool {
        let st = self.lock();
        st.target.is_none() && !st.contexts[id].save.is_empty()
    }

    pub fn is_unwinding(&self, id: CtxId) -> bool {
        let st = self.lock();
        st.target.is_some() && !st.contexts[id].save.is_empty()
    }

    pub fn unwind_pending(&self, id: CtxId) -> bool {
        let st = self.lock();
        st.target.is_some() && st.contexts[id].save.is_empty() && st.contexts[id].nlocks == 0
    }

    pub fn lock_ctx(&self, id: CtxId) {
        self.lock().contexts[id].nlocks += 1;
    }

    pub fn unlock_ctx(&self, id: CtxId) {
        let mut st = self.lock();
        st.contexts[id].nlocks = st.contexts[id].nlocks.saturating_sub(1);
        self.cond.notify_all();
    }

    pub fn push_saved(&self, id: CtxId, value: Value) {
        self.lock().contexts[id].save.push(value);
    }

    pub fn pop_saved(&self, id: CtxId) -> Option<Value> {
        let popped = self.lock().contexts[id].save.pop();
        // The last pop ends the restore; unblock any migration request
        self.cond.notify_all();
        popped
    }

    pub fn property(&self, id: CtxId, key: &str) -> Option<Value> {
        self.lock().contexts[id].properties.get(key).cloned()
    }

    pub fn pending_ids(&self) -> Vec<CtxId> {
        let st = self.lock();
        let mut ids: Vec<CtxId> = st.pending.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn finished_ids(&self) -> Vec<CtxId> {
        let st = self.lock();
        let mut ids: Vec<CtxId> = st.finished.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Save stacks and entry invocations of every pending context, for
    /// the handoff encoder. Reference values stay shared with the live
    /// contexts through their `Arc`s.
    pub fn export_pending(&self) -> Vec<(Vec<Value>, Invocation)> {
        let st = self.lock();
        let mut ids: Vec<CtxId> = st.pending.iter().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .map(|&id| {
                let ctx = &st.contexts[id];
                (ctx.save.clone(), ctx.entry.clone())
            })
            .collect()
    }

    /// Run a pending context to its next rest state. Foreground runs
    /// happen on the caller's thread; background runs get their own.
    pub fn start(self: &Arc<Self>, id: CtxId, engine: Arc<Engine>, background: bool) {
        {
            let mut st = self.lock();
            if !st.pending.remove(&id) {
                debug!("context {} is not pending; not started", id);
                return;
            }
            st.running.insert(id);
        }
        let handle = CtxHandle { coll: Arc::clone(self), id };
        if background {
            thread::spawn(move || {
                let outcome = engine.run_invocation(&handle);
                handle.coll.finalize(id, outcome);
            });
        } else {
            let outcome = engine.run_invocation(&handle);
            self.finalize(id, outcome);
        }
    }

    fn finalize(&self, id: CtxId, outcome: Result<Option<Value>, Fault>) {
        let mut st = self.lock();
        st.running.remove(&id);
        st.pending.remove(&id);
        st.contexts[id].nlocks = 0;
        match outcome {
            Err(fault) => {
                // A fault ends the context; its siblings are unaffected
                error!("context {} faulted: {}", id, fault);
                st.contexts[id].save.clear();
                st.finished.insert(id);
            }
            Ok(ret) => {
                if st.contexts[id].save.is_empty() {
                    if let Some(value) = ret {
                        st.contexts[id]
                            .properties
                            .insert(RETURN_VALUE.to_owned(), value);
                    }
                    st.finished.insert(id);
                } else {
                    debug!("context {} unwound with {} saved values", id, st.contexts[id].save.len());
                    st.pending.insert(id);
                }
            }
        }
        self.cond.notify_all();
    }

    /// Block until no context is running, then take the migration target
    /// (if any) so a completed collection never re-attempts a transfer.
    pub fn wait_for_all(&self) -> Option<String> {
        let mut st = self.lock();
        while !st.running.is_empty() {
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.target.take()
    }
}

impl CtxHandle {
    pub fn is_restoring(&self) -> bool {
        self.coll.is_restoring(self.id)
    }

    pub fn is_unwinding(&self) -> bool {
        self.coll.is_unwinding(self.id)
    }

    pub fn unwind_pending(&self) -> bool {
        self.coll.unwind_pending(self.id)
    }

    pub fn entry(&self) -> Invocation {
        self.coll.lock().contexts[self.id].entry.clone()
    }
}
