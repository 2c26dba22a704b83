//! confab-core: Core types and traits for confab
//!
//! This crate provides the foundational types shared by the transcript
//! parser, the wire-family adapters, and the streaming engine.

pub mod adapter;
pub mod error;
pub mod message;
pub mod model;
pub mod provider;
pub mod sink;

pub use adapter::{DecodeResult, PayloadAdapter, StreamDecoder, WireRequest};
pub use error::Error;
pub use message::{Message, Role, UsageStats};
pub use model::{ModelDescriptor, ModelParams, ModelTable};
pub use provider::{ChatRequest, ProviderConfig, WireKind};
pub use sink::{DocumentSink, SecretResolver};

pub type Result<T> = std::result::Result<T, Error>;
