mod error;
mod logging;

pub mod ident;
pub mod octal;

pub use error::{BridgeError, BridgeResult};
pub use logging::setup_logging;
