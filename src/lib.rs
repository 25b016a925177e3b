pub mod clock;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::CoordinationEngine;
