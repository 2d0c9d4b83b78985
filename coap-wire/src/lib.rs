//! RFC 7252 (CoAP) message parsing and serialization, plus the RFC 7959
//! block-wise transfer option. Pure codec: no sockets, no threads, no retry
//! logic -- just bytes in, a [`Packet`] out, and back.

pub mod code;
pub mod error;
pub mod option;
pub mod packet;
pub mod ty;

pub use code::{Code, CodeKind};
pub use error::{EncodeError, ParseError};
pub use option::Block;
pub use packet::{Packet, MAX_DGRAM_SIZE, VERSION};
pub use ty::Type;
