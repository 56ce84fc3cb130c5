//! Node host: runs collections locally and hands them off over TCP
//!
//! A node is either the origin (it starts a fresh collection) or a
//! receiver (it accepts a [`Handoff`] frame, restores the contexts, and
//! resumes them). When a running collection requests migration, the host
//! waits for every context to unwind, captures the pending ones into a
//! [`Snapshot`], and transfers program and snapshot to the target node.

mod wire;

pub use wire::{Handoff, SavedContext, SavedInvocation, SavedObject, SavedValue, Snapshot};

use crate::image::{ImageError, Program};
use crate::runtime::{ContextCollection, Engine, Invocation, MobileContext, Value};
use log::{error, info};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Encoding(bincode::Error),
    /// The peer violated the handoff protocol
    Protocol(String),
    Missing(String),
    Image(ImageError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {}", err),
            Error::Encoding(err) => write!(f, "encoding error: {}", err),
            Error::Protocol(what) => write!(f, "protocol error: {}", what),
            Error::Missing(what) => write!(f, "missing symbol: {}", what),
            Error::Image(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Error {
        Error::Encoding(err)
    }
}

impl From<ImageError> for Error {
    fn from(err: ImageError) -> Error {
        Error::Image(err)
    }
}

/// What one hosted collection amounted to once it went quiet.
#[derive(Debug)]
pub struct Served {
    /// Contexts that ran to completion (or faulted) on this node
    pub finished: usize,
    /// Where the still-pending contexts went, if anywhere
    pub forwarded: Option<String>,
}

/// Ship a program and snapshot to `addr` and wait for the receiver's
/// acknowledgement.
pub fn transfer(addr: &str, program: &Program, snapshot: Snapshot) -> Result<(), Error> {
    info!("transferring {} contexts to {}", snapshot.contexts.len(), addr);
    let mut stream = TcpStream::connect(addr)?;
    let payload = bincode::serialize(&Handoff { program: program.clone(), snapshot })?;
    wire::write_frame(&mut stream, &payload)?;
    let ack = wire::read_frame(&mut stream)?;
    if ack != [wire::ACK] {
        return Err(Error::Protocol("bad acknowledgement".to_owned()));
    }
    Ok(())
}

/// Accept one handoff: decode, acknowledge, then resume the contexts on
/// this node until they finish or migrate onward.
pub fn handle_connection(mut stream: TcpStream) -> Result<Served, Error> {
    let payload = wire::read_frame(&mut stream)?;
    let handoff: Handoff = bincode::deserialize(&payload)?;
    let restored = handoff.snapshot.restore()?;
    info!("received {} contexts", restored.len());
    wire::write_frame(&mut stream, &[wire::ACK])?;
    drop(stream);
    run_contexts(Arc::new(handoff.program), restored)
}

/// Serve handoffs from `listener`, at most `limit` successful ones when
/// a limit is given. Failed connections are logged and skipped.
pub fn serve(listener: TcpListener, limit: Option<usize>) -> Result<Vec<Served>, Error> {
    let mut served = vec![];
    for stream in listener.incoming() {
        match handle_connection(stream?) {
            Ok(outcome) => {
                info!(
                    "collection done: {} finished, forwarded to {:?}",
                    outcome.finished, outcome.forwarded
                );
                served.push(outcome);
            }
            Err(err) => error!("handoff failed: {}", err),
        }
        if limit.map_or(false, |n| served.len() >= n) {
            break;
        }
    }
    Ok(served)
}

pub fn listen(port: u16) -> Result<Vec<Served>, Error> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!("listening for handoffs on port {}", port);
    serve(listener, None)
}

/// Run a fresh collection from `entry` on this node, handing it off if
/// it requests migration.
pub fn run_standalone(program: Arc<Program>, entry: Invocation) -> Result<Served, Error> {
    run_contexts(program, vec![(vec![], entry)])
}

fn run_contexts(
    program: Arc<Program>,
    contexts: Vec<(Vec<Value>, Invocation)>,
) -> Result<Served, Error> {
    let engine = Arc::new(Engine::new(Arc::clone(&program)));
    let coll = Arc::new(ContextCollection::new());
    let ids: Vec<_> = contexts
        .into_iter()
        .map(|(save, entry)| coll.add(MobileContext::with_saved(entry, save)))
        .collect();
    for id in ids {
        coll.start(id, Arc::clone(&engine), true);
    }
    let finished = match coll.wait_for_all() {
        Some(addr) => {
            let snapshot = Snapshot::capture(&coll.export_pending());
            transfer(&addr, &program, snapshot)?;
            let finished = coll.finished_ids().len();
            return Ok(Served { finished, forwarded: Some(addr) });
        }
        None => coll.finished_ids().len(),
    };
    Ok(Served { finished, forwarded: None })
}
