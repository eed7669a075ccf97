pub mod backend;
pub mod config;
pub mod error;
pub mod exec;
pub mod generator;
pub mod layout;
pub mod logging;
pub mod manager;
pub mod persist;
pub mod process;
pub mod session;
pub mod shell;
pub mod status;

pub use error::{MuxError, Result};
