use std::fmt;
use std::io;

use crate::instruction::decode;

#[derive(Debug)]
pub enum EmulatorError {
    /// The executor fetched a byte it has no semantics for. `address` points
    /// at the faulting instruction, not past it.
    UnimplementedOpcode { address: u16, opcode: u8 },
    /// The machine could not be built (ROM missing, empty or oversized).
    ResourceInitialization(String),
    Config(String),
    Io(io::Error),
    Json(serde_json::Error),
    ThreadPanicked,
}

impl fmt::Display for EmulatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulatorError::UnimplementedOpcode { address, opcode } => write!(
                f,
                "no instruction implemented at address {:04x}: opcode {:02x} ({})",
                address,
                opcode,
                decode(*opcode)
            ),
            EmulatorError::ResourceInitialization(msg) => {
                write!(f, "failed to initialise emulator: {}", msg)
            }
            EmulatorError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            EmulatorError::Io(err) => write!(f, "i/o error: {}", err),
            EmulatorError::Json(err) => write!(f, "json error: {}", err),
            EmulatorError::ThreadPanicked => write!(f, "emulation thread panicked"),
        }
    }
}

impl std::error::Error for EmulatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmulatorError::Io(err) => Some(err),
            EmulatorError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EmulatorError {
    fn from(err: io::Error) -> Self {
        EmulatorError::Io(err)
    }
}

impl From<serde_json::Error> for EmulatorError {
    fn from(err: serde_json::Error) -> Self {
        EmulatorError::Json(err)
    }
}
