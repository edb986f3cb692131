pub mod interface;
pub mod platform;

pub use interface::{has_awdl, select_interfaces, BridgeInterface, AWDL_INTERFACE};
