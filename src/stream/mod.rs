//! Session output decoding.
//!
//! - `codec`: [`StreamDecoder`], newline framing with a bounded buffer.
//! - `parser`: maps one framed record to a typed message body.

pub mod codec;
pub mod parser;

pub use codec::{StreamDecoder, DEFAULT_MAX_RECORD_BYTES};
pub use parser::parse_record;
