use crate::image::{ImageError, MethodId};

/// Errors from stack inference or method rewriting
///
/// Any of these rejects the whole image; no partially rewritten program
/// is ever produced.
#[derive(Debug)]
pub enum Error {
    /// An instruction pops more slots than the stack holds
    StackUnderflow { offset: u32 },
    /// An instruction's operands have a shape the transfer can't model
    StackShape { offset: u32, expected: &'static str },
    /// Two control-flow edges meet with different stack depths
    JoinMismatch { offset: u32, left: usize, right: usize },
    /// A slot index is out of range for the local or argument table
    BadSlot { offset: u32, index: u16 },
    /// A checkpoint landed on an unmanaged-pointer stack; the eligibility
    /// rule is supposed to make this impossible
    DirtyRestorePoint { offset: u32 },
    /// Method selected for rewriting has no body
    NoBody(MethodId),
    /// Branch or region fixup against a label that was never placed
    UnplacedLabel,
    /// `begin_try`/`begin_handler`/`end_region` called out of order
    RegionState(&'static str),
    /// Symbol-map lookup missed during the second pass
    SymbolMiss(String),
    Image(ImageError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::StackUnderflow { offset } => {
                write!(f, "operand stack underflow at offset {}", offset)
            }
            Error::StackShape { offset, expected } => {
                write!(f, "bad operand stack at offset {}: expected {}", offset, expected)
            }
            Error::JoinMismatch { offset, left, right } => write!(
                f,
                "stack depth mismatch joining at offset {}: {} vs {}",
                offset, left, right
            ),
            Error::BadSlot { offset, index } => {
                write!(f, "slot index {} out of range at offset {}", index, offset)
            }
            Error::DirtyRestorePoint { offset } => {
                write!(f, "restore point at offset {} has a pointer on the stack", offset)
            }
            Error::NoBody(id) => write!(f, "method {}.{} has no body", id.owner.0, id.index),
            Error::UnplacedLabel => write!(f, "branch to a label that was never placed"),
            Error::RegionState(what) => write!(f, "exception region misuse: {}", what),
            Error::SymbolMiss(what) => write!(f, "symbol map has no entry for {}", what),
            Error::Image(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<ImageError> for Error {
    fn from(err: ImageError) -> Error {
        Error::Image(err)
    }
}
