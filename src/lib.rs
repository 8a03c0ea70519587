#![deny(missing_docs)]
//! # kvsub
//! A multi-threaded, in-memory key-value store server with a
//! publish/subscribe notification layer, fronted by named-pipe IPC.
//!
//! The server drains a directory of batch `.job` files (WRITE / READ /
//! DELETE / SHOW / WAIT / BACKUP) on a pool of job runners while serving
//! interactive sessions over FIFOs: clients SUBSCRIBE to keys and receive a
//! notification record whenever a subscribed key is written or deleted.
//!
//! The pieces, bottom up:
//! - [`store`] — the sharded, reader/writer-locked hash table, with the
//!   subscription registry woven into its entries
//! - [`admission`] — the bounded rendezvous between the acceptor and the
//!   session worker pool
//! - [`worker`] / [`acceptor`] — the session-serving side
//! - [`jobs`] / [`parser`] / [`backup`] — the batch side
//! - [`Server`] wires them together; [`Client`] is the session API

pub use client::Client;
pub use error::{KvsubError, Result};
pub use server::{Server, ServerConfig};
pub use store::KvStore;

pub mod acceptor;
pub mod admission;
pub mod backup;
mod client;
mod error;
pub mod jobs;
pub mod parser;
pub mod protocol;
pub mod session;
mod server;
pub mod store;
pub mod thread_pool;
pub mod worker;
