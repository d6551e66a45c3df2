pub mod loader;
pub mod settings;

pub use loader::{load_config, parse_config};
pub use settings::EngineSettings;
