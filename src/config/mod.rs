//! Agent config files, test plan files, and run output.
mod apply;
mod loader;
mod plan;
pub mod types;


pub use apply::agent_settings;
pub use loader::{DEFAULT_CONFIG_FILES, load_config, load_config_file};
pub use plan::{load_plan, write_run};
