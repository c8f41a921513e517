//! Configuration loading for the gateway.
//!
//! Config files are TOML, YAML or JSON, may reference environment variables
//! as `${NAME}`, and every section falls back to its defaults.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{clear_config_dir, config_dir, discover_and_load, load_config, set_config_dir},
    schema::{AuthConfig, HanaConfig, MqConfig, ServerConfig, StreamingConfig, expose},
};
