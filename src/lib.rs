//! Bridge that lets devices without native AirDrop support appear to
//! AirDrop senders as legitimate receivers.
//!
//! Back-end peers connect over a persistent channel and are advertised on
//! mDNS as AirDrop receivers; senders then talk to the HTTPS endpoints and
//! uploaded archives are unpacked and handed to the peer file by file.

pub mod config;
pub mod cpio;
pub mod mdns;
pub mod net;
pub mod protocols;
pub mod utils;
