use std::fmt;

use crate::cost::OpType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Custom calculator rejected at registration time
    Signature(String),
    /// No override and no default calculator for this op type
    UnsupportedOperation(OpType),
    /// Calculator raised, or returned something other than three non-negative integers
    CalculatorResult { op_type: OpType, reason: String },
    /// Report lookup by an unknown label
    NotFound(String),
    /// Session used outside its lifecycle (re-entry, events while inactive)
    SessionState(String),
    /// Malformed model or engine-side failure
    Graph(String),
    /// Bad configuration document
    Config(String),
    /// File I/O
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Signature(msg) => write!(f, "invalid cost calculator signature: {msg}"),
            Error::UnsupportedOperation(op) => {
                write!(f, "no cost calculator registered for operation '{op}'")
            }
            Error::CalculatorResult { op_type, reason } => {
                write!(f, "cost calculator for '{op_type}' returned a bad result: {reason}")
            }
            Error::NotFound(label) => write!(f, "no report entry labelled '{label}'"),
            Error::SessionState(msg) => write!(f, "session state error: {msg}"),
            Error::Graph(msg) => write!(f, "graph error: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
