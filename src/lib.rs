//! AirShare library
//!
//! AirDrop-compatible peer-to-peer transfer: mDNS discovery, TLS/HTTP control
//! messages and gzip-compressed cpio upload archives.

pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod entity;
pub mod environment;
pub mod error;
pub mod file_types;
pub mod listener;
pub mod logger;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod pipe;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;

pub use config::Config;
pub use entity::{Entity, FileEntity, MemoryEntity};
pub use environment::ReadyStatus;
pub use manager::AirDropManager;
pub use peer::Peer;
