pub mod airdrop;
pub mod channel;
pub mod flags;
pub mod http_server;
pub mod messages;
pub mod registry;
pub mod sender_record;
pub mod wire;
