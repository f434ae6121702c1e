//! Envelope codec, transport framing and the protocol command namespace for
//! msgpak.
//!
//! ## Envelope
//!
//! ```text
//! blob = base64( deflate( json{ cmd, data, checksum } ) )
//!
//! key      = long_lived_key + shared_secret + ":" + sha384_hex(cmd)
//! data     = base64( nonce || chacha20poly1305(key, plaintext) )
//! checksum = sha512_hex( cmd + "\n" + data + "\n" + plaintext )
//! ```
//!
//! ## Transport frame
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 kind              | 1 text, 2 close, 3/4 auth  |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod command;
pub mod crypto;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::{
    compose, envelope_size_bound, parse, Envelope, EnvelopeKeys, ParsedEnvelope,
    DEFAULT_MAX_MESSAGE_SIZE, INFLATE_HEADROOM,
};
pub use command::{
    validate_app_command, validate_task_command, CommandError, ProtocolCommand, ERROR_MARKER,
    MAX_COMMAND_LEN,
};
pub use error::{EnvelopeError, FrameError};
pub use frame::{Frame, FrameDecoder, FrameKind, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
