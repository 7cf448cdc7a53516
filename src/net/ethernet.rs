// ============================================================================
// src/net/ethernet.rs - Ethernet Addressing
// ============================================================================

use core::fmt;

/// Ethernetヘッダ長
pub const ETH_HEADER_LEN: usize = 14;

/// 標準MTU
pub const ETH_MTU: u16 = 1500;

/// ヘッダ込みの最大フレーム長（FCSなし）
pub const ETH_FRAME_MAX: usize = ETH_HEADER_LEN + ETH_MTU as usize;

/// MACアドレス
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Zero MAC address (00:00:00:00:00:00)
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    /// Create a new MAC address from bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Get the underlying bytes
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Check if this is a broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// Check if this is a multicast address (LSB of first byte is 1)
    pub const fn is_multicast(&self) -> bool {
        (self.0[0] & 0x01) != 0
    }

    /// Check if this is a locally administered address
    pub const fn is_local(&self) -> bool {
        (self.0[0] & 0x02) != 0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_mac_display() {
        let mac = MacAddress::new([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]);
        assert_eq!(format!("{}", mac), "52:54:00:ab:cd:ef");
        assert!(!mac.is_multicast());
        assert!(mac.is_local());
        assert!(MacAddress::BROADCAST.is_broadcast());
    }
}
