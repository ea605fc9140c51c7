//! Application glue for Tandem: settings, logging, on-disk key storage,
//! direct-message sealing and routing of call signals to the active session.

pub mod calls;
pub mod config;
pub mod keystore;
pub mod logging;
pub mod messaging;

pub use calls::{CallRouter, RouterNotice};
pub use config::{load_config, save_config, ClientConfig};
pub use keystore::FileSecureStore;
pub use logging::init_logging;
pub use messaging::{open_direct_message, seal_direct_message, OpenedBody, SealedBody};
