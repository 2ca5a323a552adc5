#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # hearth
//!
//! hearth is a small, correct HTTP/1.0 and HTTP/1.1 server engine built on
//! plain OS threads and blocking sockets.
//!
//! It sits between raw stream sockets and an application-supplied request
//! handler (a [`Gateway`]): it parses request lines and headers, enforces
//! size limits, keeps connections alive across pipelined requests, decodes
//! chunked request bodies, frames chunked response bodies, and owns the
//! lifecycle of the listening socket and the worker pool.
//!
//! It is deliberately *not* a web framework. There is no routing, no body
//! decoding beyond transfer-coding, no HTTP/2, and no file serving; the
//! engine hands the gateway a bounded byte stream and writes back whatever
//! bytes the gateway produces.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hearth::{Request, Server};
//!
//! let server = Server::builder(("127.0.0.1", 8080))
//!     .build(|req: &mut Request<'_>| {
//!         req.set_status(200)?;
//!         req.add_header("Content-Type", "text/plain");
//!         req.write(b"hello\n")
//!     })
//!     .unwrap();
//!
//! let server = Arc::new(server);
//! // `start()` blocks on the accept loop; `server.stop()` from another
//! // thread shuts it down within the configured grace window.
//! server.safe_start().unwrap();
//! ```

pub use crate::error::{Error, Result};
pub use crate::proto::h1::Protocol;
pub use crate::server::conn::Transport;
pub use crate::server::request::Request;
pub use crate::server::{BindAddr, Builder, Server};
pub use crate::service::Gateway;
pub use crate::stats::{ServerStats, StatsSnapshot};
pub use crate::tls::{TlsAdapter, TlsEnv, TlsError};

mod error;
#[cfg(test)]
mod mock;
mod proto;
mod server;
mod service;
mod stats;
mod tls;
