//! # evma-core
//!
//! Core types for the EVMA event machine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The scheduler, reactor, worker pool, and resource layer live in
//! `evma-runtime`.
//!
//! ## Modules
//!
//! - `id` - task identifier type
//! - `value` - dynamically-typed resumption values
//! - `error` - error types
//! - `buffer` - fixed-capacity input buffer with cursor-delimited valid range
//! - `parser` - the incremental parser contract
//! - `parsers` - built-in parsers (available, exact, all, line)
//! - `http` - HTTP request/response parser built on the parser contract
//! - `spinlock` - internal spinlock primitive
//! - `kprint` - kernel-style debug printing macros
//! - `env` - environment variable utilities

pub mod id;
pub mod value;
pub mod error;
pub mod buffer;
pub mod parser;
pub mod parsers;
pub mod http;
pub mod spinlock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::TaskId;
pub use value::Value;
pub use error::{RtError, RtResult};
pub use buffer::{InputBuf, INPUTBUF_SIZE};
pub use parser::{CloseReason, ParseError, ParseStatus, Parser};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_str, env_is_set};
