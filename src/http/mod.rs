//! HTTP message model and tokenizers.
//!
//! This module holds everything that knows about HTTP/1.x syntax. It does not
//! read from anything itself; the half-stream readers in [`crate::stream`]
//! pull bytes and hand complete lines to the parser.
//!
//! # Architecture
//!
//! - **`event`**: the request/response events emitted for each transaction
//! - **`parser`**: start-line, header-line and chunk-size tokenizers plus the
//!   body framing rules
//!
//! # Message layout
//!
//! ```text
//!   start line      GET /a HTTP/1.1            ← parse_request_line / parse_status_line
//!   header block    Host: x                    ← parse_header_line (until empty line)
//!                   Content-Length: 5
//!                   <empty line>
//!   body            hello                      ← body_framing decides the delimiting
//! ```

pub mod event;
pub mod parser;

pub use event::{Endpoints, Envelope, Event, EventKind, HeaderItem, RequestEvent, ResponseEvent};
pub use parser::{BodyOrigin, Framing, ParseError, RequestLine, StatusLine};
