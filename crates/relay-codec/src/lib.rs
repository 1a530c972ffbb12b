// relay-codec: WeeChat relay binary wire format.
//
// Messages are length-framed and carry a string message ID followed by a
// sequence of typed objects, each introduced by a 3-byte ASCII type code.
// Relay clients deserialize hdata items positionally, so key order is part
// of the wire contract and is preserved end to end.

mod decode;
mod encode;
mod object;

pub use decode::decode_message;
pub use encode::encode_message;
pub use object::{Hashtable, Hdata, HdataItem, Message, ObjType, Object};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while decoding a relay frame.
///
/// The decoder never panics on arbitrary input; every malformed shape maps
/// to one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} more byte(s)")]
    Truncated { needed: usize },
    #[error("unknown object type code: {0:?}")]
    UnknownType(String),
    #[error("length prefix {declared} does not match frame size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("compressed frames are not supported (flag {0})")]
    Compressed(u8),
    #[error("invalid string length {0}")]
    InvalidLength(i32),
    #[error("invalid UTF-8 in {context}")]
    Utf8 { context: &'static str },
    #[error("invalid ASCII number in {context}")]
    BadNumber { context: &'static str },
    #[error("malformed hdata key declaration: {0:?}")]
    BadKeyDecl(String),
}
