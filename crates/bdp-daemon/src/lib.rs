//! Browsing-data provider daemon.
//!
//! A single background process owns a device's browsing data (bookmarks,
//! open tabs, visit history, saved pages) and is the sole writer of the
//! per-domain `SQLite` databases. Browser and sync processes connect over a
//! private Unix socket and speak the binary protocol from [`bdp_core`];
//! large image payloads can cross through a per-session shared-memory
//! segment instead of the socket.
//!
//! Module map:
//!
//! - [`server`]: socket lifecycle, connect/attach handshake, session workers
//! - [`dispatch`]: per-command request handling
//! - [`storage`]: per-domain engines over `rusqlite`, plus the search builder
//! - [`slots`]: the bounded session pool with LRU eviction
//! - [`notify`]: data-changed fan-out to compatible sessions
//! - [`shm`]: the shared-memory blob channel
//! - [`policy`]: peer credentials and the per-request permission gate
//! - [`config`] / [`state`]: settings and the shared daemon context

pub mod config;
pub mod dispatch;
pub mod notify;
pub mod policy;
pub mod server;
pub mod shm;
pub mod slots;
pub mod state;
pub mod storage;

pub use config::DaemonConfig;
pub use server::ProviderServer;
pub use state::DaemonContext;
