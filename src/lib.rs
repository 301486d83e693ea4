//! detdns is a forwarding DNS proxy that records which client asked for
//! which name, feeding a detection pipeline for rogue local DNS servers.
//!
//! # Features
//! * Plain DNS over UDP on the client and upstream side, with ordered
//!   fallback across the configured resolvers.
//! * EDNS(0) Client Subnet handling ([RFC 7871]): queries arriving without
//!   an ECS option get one synthesized from the client's source address,
//!   and the synthesized option is stripped from the answer again. A
//!   client-supplied option passes through untouched in both directions.
//! * A sharded, non-blocking query log: every accepted query is routed by
//!   two independent CRC32 hashes onto a `backends x channels` grid of
//!   bounded queues and written to Redis (`SETEX name ttl client_ip`) by a
//!   dedicated worker per cell. When a cell is full the record is dropped
//!   and counted; resolution never waits for the log.
//! * Periodic qps / failed-rate accounting, to the log and optionally to a
//!   stats file.
//!
//! # Usage
//!
//! ```no_run
//! use detdns::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), detdns::Error> {
//!     let config = Config::load("detdns.json")?;
//!     let server = Server::new(config)?;
//!
//!     // Serves until SIGINT or SIGTERM.
//!     server.run().await
//! }
//! ```
//!
//! # Testing
//!
//! ```shell
//! $ cargo test --all
//! ```
//!
//! The integration tests in `tests/` run the full pipeline against a stub
//! upstream resolver and a stub Redis backend, no external services needed.
//!
//! ## Reference
//!
//! * [rfc1035]: DOMAIN NAMES - IMPLEMENTATION AND SPECIFICATION
//! * [rfc6891]: Extension Mechanisms for DNS (EDNS(0))
//! * [RFC 7871]: Client Subnet in DNS Queries
//!
//! [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
//! [rfc6891]: https://datatracker.ietf.org/doc/html/rfc6891
//! [RFC 7871]: https://datatracker.ietf.org/doc/html/rfc7871

pub mod clients;
pub mod config;
mod dns;
mod errors;
pub mod hash;
mod io;
pub mod pool;
pub mod qlog;
pub mod resource;
pub mod server;
pub mod stats;
pub mod subnet;
pub mod types;

#[macro_use]
extern crate num_derive;

#[macro_use]
extern crate lazy_static;

// Pull up the various types that should be on the front page of the docs.
#[doc(inline)]
pub use crate::types::*;

#[doc(inline)]
pub use crate::resource::*;

#[doc(inline)]
pub use crate::config::Config;

#[doc(inline)]
pub use crate::server::Server;

pub use crate::errors::Error;
