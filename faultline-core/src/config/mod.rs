//! Configuration management for the faultline harness
//!
//! - Schema-driven configuration with `validator` field rules
//! - Layered loading: defaults, `faultline.toml`, `FAULTLINE_*` environment, overrides
//! - Cross-field validation
//!
//! ```no_run
//! use faultline_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_override("cluster.server_count", 5)
//!     .load()?;
//! assert_eq!(config.cluster.server_count, 5);
//! # Ok::<(), faultline_core::Error>(())
//! ```

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::ConfigValidator;

use crate::Result;

/// Load configuration from the default search paths and the process environment
pub fn load_default() -> Result<HarnessConfig> {
    ConfigLoader::new().load()
}

/// Validate a configuration object
pub fn validate(config: &HarnessConfig) -> Result<()> {
    ConfigValidator::validate(config)
}
