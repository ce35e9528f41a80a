//! # evma - an event-driven coroutine machine
//!
//! A single-threaded cooperative scheduler that multiplexes many logical
//! threads of control over non-blocking fds, with a background worker pool
//! for blocking syscalls and an incremental-parser framework shared by
//! every byte source.
//!
//! Application code is written as straight-line sequential logic that
//! suspends at I/O boundaries and resumes later — no callback inversion.
//!
//! ## Quick start
//!
//! ```ignore
//! use evma::{Runtime, RuntimeConfig, Outcome, Progress};
//! use evma::parsers::Line;
//!
//! fn main() {
//!     let mut rt = Runtime::new(RuntimeConfig::from_env()).unwrap();
//!
//!     let stream = evma::IStream::from_raw_fd(0);
//!     let mut step = 0;
//!     rt.spawn_fn(move |rt, args| {
//!         if step == 0 {
//!             step = 1;
//!             return match stream.readp(rt, Box::new(Line::default())) {
//!                 Progress::Complete(vals) => {
//!                     println!("{:?}", vals[0]);
//!                     Outcome::Finished
//!                 }
//!                 Progress::Suspended => Outcome::Suspended,
//!             };
//!         }
//!         println!("{:?}", args[0]);
//!         Outcome::Finished
//!     });
//!
//!     std::process::exit(rt.run());
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────┐
//!  │                  application tasks                   │
//!  │        readp() / write() / accept() / sleep()        │
//!  └──────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//!  ┌──────────────────────────────────────────────────────┐
//!  │           scheduler (FIFO run queue, 1 thread)       │
//!  └──────────────────────────────────────────────────────┘
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//!    ┌───────────┐     ┌────────────┐     ┌───────────┐
//!    │  poll(2)  │     │   timers   │     │  worker   │
//!    │  watches  │     │            │     │   pool    │
//!    └───────────┘     └────────────┘     └───────────┘
//! ```

// Re-export core types
pub use evma_core::{
    buffer::{InputBuf, INPUTBUF_SIZE},
    error::{RtError, RtResult},
    http,
    id::TaskId,
    parser::{CloseReason, ParseError, ParseStatus, Parser},
    parsers,
    value::Value,
};

// Re-export kprint macros for debug logging
pub use evma_core::kprint;
pub use evma_core::kprint::{init as init_logging, set_log_level, LogLevel};
pub use evma_core::{kdebug, kerror, kinfo, ktrace, kwarn};

// Re-export env utilities
pub use evma_core::{env_get, env_get_bool, env_get_str, env_is_set};

// Re-export runtime types
pub use evma_runtime::{
    open, stream_pair, AsyncJob, File, IStream, OStream, Outcome, Progress, Runtime,
    RuntimeConfig, Server, Sleeper, Task, TaskHandle, EXIT_FAILURE, EXIT_SUCCESS,
};
