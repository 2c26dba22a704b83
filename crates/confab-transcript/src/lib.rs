//! confab-transcript: Transcript parsing and context construction
//!
//! Turns a plain-text conversation document into an addressable
//! exchange model, and turns that model plus a memory policy into the
//! message list a provider request is built from.

pub mod context;
pub mod model;
pub mod parser;

pub use context::{build_context, MemoryPolicy};
pub use model::{
    Exchange, ExchangeComponent, FileReference, HeaderValue, Line, TextSpan, Transcript,
};
pub use parser::{extract_fenced_block, find_separator, parse, ParserConfig};
