//! Wire-level DNS message codec (spec.md §4.1, component C1).
//!
//! Operates on raw byte buffers rather than a typed message tree, since the
//! query path only ever needs to read a handful of fields and perform
//! targeted in-place rewrites of an otherwise-opaque captured packet.
pub mod header;
pub mod name;
pub mod opt;
pub mod question;
pub mod rr;

pub use header::HEADER_LEN;
pub use question::{parse_question, Question};
pub use rr::min_ttl;
