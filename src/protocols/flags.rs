//! Receiver capability flags advertised in the `flags` TXT key.

use bitflags::bitflags;

bitflags! {
    /// Capability bits AirDrop receivers advertise. Senders ignore bits
    /// they do not know, so adding one is backwards-compatible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReceiverFlags: u16 {
        const URL = 1 << 0;
        const DVZIP = 1 << 1;
        const PIPELINING = 1 << 2;
        const MIXED_TYPES = 1 << 3;
        const UNKNOWN1 = 1 << 4;
        const UNKNOWN2 = 1 << 5;
        const IRIS = 1 << 6;
        const DISCOVER = 1 << 7;
        const UNKNOWN3 = 1 << 8;
        const ASSET_BUNDLE = 1 << 9;
    }
}

impl ReceiverFlags {
    /// What the bridge advertises. DvZip is deliberately absent: archives
    /// we cannot decode must not be invited.
    pub fn advertised() -> Self {
        Self::URL | Self::PIPELINING | Self::MIXED_TYPES | Self::DISCOVER | Self::ASSET_BUNDLE
    }

    /// Decimal rendering used as the TXT value.
    pub fn txt_value(&self) -> String {
        self.bits().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_layout_is_fixed() {
        assert_eq!(ReceiverFlags::URL.bits(), 1);
        assert_eq!(ReceiverFlags::DVZIP.bits(), 2);
        assert_eq!(ReceiverFlags::PIPELINING.bits(), 4);
        assert_eq!(ReceiverFlags::MIXED_TYPES.bits(), 8);
        assert_eq!(ReceiverFlags::DISCOVER.bits(), 128);
        assert_eq!(ReceiverFlags::ASSET_BUNDLE.bits(), 512);
    }

    #[test]
    fn advertised_set_excludes_dvzip() {
        let flags = ReceiverFlags::advertised();
        assert!(flags.contains(ReceiverFlags::URL));
        assert!(flags.contains(ReceiverFlags::PIPELINING));
        assert!(flags.contains(ReceiverFlags::MIXED_TYPES));
        assert!(flags.contains(ReceiverFlags::DISCOVER));
        assert!(flags.contains(ReceiverFlags::ASSET_BUNDLE));
        assert!(!flags.contains(ReceiverFlags::DVZIP));
        assert_eq!(flags.txt_value(), "653");
    }

    #[test]
    fn unknown_bits_survive_round_trips() {
        let raw = ReceiverFlags::advertised().bits() | 1 << 15;
        let flags = ReceiverFlags::from_bits_retain(raw);
        assert_eq!(flags.bits(), raw);
    }
}
