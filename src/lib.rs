pub mod types;
pub mod error;
pub mod time;
pub mod data;
pub mod cascade;
pub mod config;

pub use types::*;
pub use error::{CascadeError, Result};
pub use cascade::{CascadeChain, CascadeEngine, CascadeStats};
pub use config::EngineSettings;
