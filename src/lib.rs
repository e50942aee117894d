pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod stage;
pub mod util;

pub use error::{Error, Result};
