pub mod config;
pub mod error;
pub mod exec;
pub mod launcher;
pub mod shutdown;
pub mod sync;

pub use error::{PodlinkError, Result};
