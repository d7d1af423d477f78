pub mod archive;
pub mod assets;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod envfile;
pub mod error;
pub mod fsutil;
pub mod kops;
pub mod shell;
pub mod store;
pub mod sync;
pub mod terraform;

pub use error::{Error, ErrorKind, Result};
