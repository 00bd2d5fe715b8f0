pub mod ascii;

pub use ascii::{AsciiCommand, AsciiResponse, StoreMode};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol parse error: {0}")]
    ParseError(String),
}
