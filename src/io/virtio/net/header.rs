// ============================================================================
// src/io/virtio/net/header.rs - VirtIO Net Header Codec
// ============================================================================
//!
//! 各パケットの先頭に付くvirtio-netヘッダのエンコード/デコード
//!
//! レガシーではフィールドはゲストネイティブのバイト順（対象はリトルエンディアン）。
//! パディングなしで詰め、MRG_RXBUFネゴシエート時のみ末尾に `num_buffers` が付く。
//!
//! ```text
//! 0      1         2        4         6           8            10           12
//! | flags | gso_type | hdr_len | gso_size | csum_start | csum_offset | num_buffers |
//! ```

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// ヘッダフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HdrFlags: u8 {
        /// csum_start/csum_offset に従ってチェックサムが必要
        const NEEDS_CSUM = 1;
        /// チェックサム検証済み（受信時）
        const DATA_VALID = 2;
    }
}

/// GSOタイプ
pub mod gso {
    pub const NONE: u8 = 0;
    pub const TCPV4: u8 = 1;
    pub const UDP: u8 = 3;
    pub const TCPV6: u8 = 4;
    /// ECNビット（他のタイプとOR）
    pub const ECN: u8 = 0x80;
}

/// ヘッダレイアウト（ネゴシエーション後に一度だけ決まる）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    /// 10バイト
    Legacy,
    /// 12バイト（num_buffers付き）
    Mergeable,
}

impl HeaderLayout {
    /// ヘッダのバイト数
    pub const fn size(self) -> usize {
        match self {
            HeaderLayout::Legacy => 10,
            HeaderLayout::Mergeable => 12,
        }
    }

    /// ネゴシエートされたMRG_RXBUFから決める
    pub const fn for_mergeable(mrg_rxbuf: bool) -> Self {
        if mrg_rxbuf {
            HeaderLayout::Mergeable
        } else {
            HeaderLayout::Legacy
        }
    }
}

/// ヘッダの最大サイズ
pub const MAX_HEADER_SIZE: usize = 12;

/// virtio-netヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtioNetHdr {
    pub flags: HdrFlags,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    /// Mergeableレイアウトのみ。Legacyでは常に0
    pub num_buffers: u16,
}

/// デコードエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// 入力がヘッダサイズに満たない
    Truncated { needed: usize, got: usize },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::Truncated { needed, got } => {
                write!(f, "header needs {} bytes, got {}", needed, got)
            }
        }
    }
}

impl VirtioNetHdr {
    /// オフロードなしの送信用ヘッダ
    pub const fn empty() -> Self {
        Self {
            flags: HdrFlags::empty(),
            gso_type: gso::NONE,
            hdr_len: 0,
            gso_size: 0,
            csum_start: 0,
            csum_offset: 0,
            num_buffers: 0,
        }
    }

    /// 送信用に整える（num_buffersは常に0）
    pub fn for_tx(mut self) -> Self {
        self.num_buffers = 0;
        self
    }

    /// `out` にエンコードし、書いたバイト数を返す
    ///
    /// `out` がレイアウトより短い場合は何も書かずに0を返す。
    pub fn encode(&self, layout: HeaderLayout, out: &mut [u8]) -> usize {
        let size = layout.size();
        let Some(out) = out.get_mut(..size) else {
            return 0;
        };
        out[0] = self.flags.bits();
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        if layout == HeaderLayout::Mergeable {
            out[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        }
        size
    }

    /// `bytes` の先頭からデコード
    ///
    /// Legacyレイアウトには `num_buffers` がないので0になる。
    pub fn decode(layout: HeaderLayout, bytes: &[u8]) -> Result<Self, HeaderError> {
        let size = layout.size();
        if bytes.len() < size {
            return Err(HeaderError::Truncated {
                needed: size,
                got: bytes.len(),
            });
        }
        let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
        Ok(Self {
            flags: HdrFlags::from_bits_retain(bytes[0]),
            gso_type: bytes[1],
            hdr_len: u16_at(2),
            gso_size: u16_at(4),
            csum_start: u16_at(6),
            csum_offset: u16_at(8),
            num_buffers: match layout {
                HeaderLayout::Legacy => 0,
                HeaderLayout::Mergeable => u16_at(10),
            },
        })
    }

    /// このフレームが使うバッファ数（Legacyは常に1）
    pub fn frame_buffers(&self, layout: HeaderLayout) -> u16 {
        match layout {
            HeaderLayout::Legacy => 1,
            HeaderLayout::Mergeable => self.num_buffers,
        }
    }

    /// オフロード要求が何もないか
    pub fn is_plain(&self) -> bool {
        self.flags.is_empty() && self.gso_type == gso::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(HeaderLayout::Legacy.size(), 10);
        assert_eq!(HeaderLayout::Mergeable.size(), 12);
        assert_eq!(HeaderLayout::for_mergeable(true), HeaderLayout::Mergeable);
    }

    fn samples() -> [VirtioNetHdr; 4] {
        [
            VirtioNetHdr::empty(),
            VirtioNetHdr {
                flags: HdrFlags::NEEDS_CSUM,
                gso_type: gso::TCPV4 | gso::ECN,
                hdr_len: 54,
                gso_size: 1448,
                csum_start: 34,
                csum_offset: 16,
                num_buffers: 3,
            },
            VirtioNetHdr {
                flags: HdrFlags::DATA_VALID,
                gso_type: gso::UDP,
                hdr_len: 42,
                gso_size: 1472,
                csum_start: 0xffff,
                csum_offset: 6,
                num_buffers: 1,
            },
            VirtioNetHdr {
                flags: HdrFlags::from_bits_retain(0xff),
                gso_type: gso::TCPV6,
                hdr_len: 0xffff,
                gso_size: 0x8001,
                csum_start: 0x0100,
                csum_offset: 0xfffe,
                num_buffers: 0xffff,
            },
        ]
    }

    #[test]
    fn test_round_trip_both_layouts() {
        for hdr in samples() {
            let mut buf = [0u8; MAX_HEADER_SIZE];
            assert_eq!(hdr.encode(HeaderLayout::Mergeable, &mut buf), 12);
            assert_eq!(VirtioNetHdr::decode(HeaderLayout::Mergeable, &buf), Ok(hdr));

            // Legacyにはnum_buffersがない
            let legacy = VirtioNetHdr {
                num_buffers: 0,
                ..hdr
            };
            let mut buf = [0xaau8; MAX_HEADER_SIZE];
            assert_eq!(legacy.encode(HeaderLayout::Legacy, &mut buf), 10);
            assert_eq!(&buf[10..], &[0xaa, 0xaa]);
            assert_eq!(VirtioNetHdr::decode(HeaderLayout::Legacy, &buf), Ok(legacy));
        }
    }

    #[test]
    fn test_frame_buffers() {
        let hdr = VirtioNetHdr::empty();
        assert_eq!(hdr.frame_buffers(HeaderLayout::Legacy), 1);
        assert_eq!(hdr.frame_buffers(HeaderLayout::Mergeable), 0);
        let merged = VirtioNetHdr {
            num_buffers: 4,
            ..hdr
        };
        assert_eq!(merged.frame_buffers(HeaderLayout::Legacy), 1);
        assert_eq!(merged.frame_buffers(HeaderLayout::Mergeable), 4);
    }

    #[test]
    fn test_wire_format_is_packed_le() {
        let hdr = VirtioNetHdr {
            hdr_len: 0x0102,
            csum_offset: 0x0a0b,
            ..VirtioNetHdr::empty()
        };
        let mut buf = [0xffu8; 10];
        hdr.encode(HeaderLayout::Legacy, &mut buf);
        assert_eq!(buf, [0, 0, 0x02, 0x01, 0, 0, 0, 0, 0x0b, 0x0a]);
    }

    #[test]
    fn test_tx_header_zeroes_num_buffers() {
        let hdr = VirtioNetHdr {
            num_buffers: 9,
            ..VirtioNetHdr::empty()
        }
        .for_tx();
        let mut buf = [0xffu8; 12];
        hdr.encode(HeaderLayout::Mergeable, &mut buf);
        assert_eq!(buf, [0u8; 12]);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            VirtioNetHdr::decode(HeaderLayout::Mergeable, &[0u8; 11]),
            Err(HeaderError::Truncated { needed: 12, got: 11 })
        );
        assert_eq!(VirtioNetHdr::empty().encode(HeaderLayout::Legacy, &mut [0u8; 4]), 0);
    }
}
