use std::path::PathBuf;

use clap::Parser;

/// Runtime options for the bridge process.
#[derive(Debug, Clone, Parser)]
#[command(name = "airbridge", about = "AirDrop receiver bridge for non-Apple peers")]
pub struct Config {
    /// HTTPS port the AirDrop endpoints listen on.
    #[arg(long, default_value_t = 8771)]
    pub listen_port: u16,

    /// TCP port back-end peers connect to.
    #[arg(long, default_value_t = 8772)]
    pub peer_port: u16,

    /// Directory completed uploads are moved under and served from.
    #[arg(long)]
    pub upload_path: PathBuf,

    /// Restrict mDNS to the named interfaces (repeatable). When omitted the
    /// interface policy applies and an AWDL interface is required.
    #[arg(long = "interface")]
    pub interfaces: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_and_defaults() {
        let config = Config::parse_from(["airbridge", "--upload-path", "/tmp/drops"]);
        assert_eq!(config.listen_port, 8771);
        assert_eq!(config.peer_port, 8772);
        assert_eq!(config.upload_path, PathBuf::from("/tmp/drops"));
        assert!(config.interfaces.is_empty());
    }

    #[test]
    fn accepts_repeated_interfaces() {
        let config = Config::parse_from([
            "airbridge",
            "--upload-path",
            "/tmp/drops",
            "--interface",
            "en0",
            "--interface",
            "awdl0",
        ]);
        assert_eq!(config.interfaces, vec!["en0".to_string(), "awdl0".to_string()]);
    }
}
