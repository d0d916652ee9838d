//! Hub service basic library
//!
//! Provides the bootstrap functions shared by the hub binaries:
//! - logging initialization
//! - command-line arguments
//! - layered configuration loading
//! - shutdown signal handling

pub mod bootstrap_args;
pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use config_loader::load_config;
pub use logging::{init_logging, LogOptions};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
