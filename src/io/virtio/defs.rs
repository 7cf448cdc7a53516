// ============================================================================
// src/io/virtio/defs.rs - VirtIO Legacy Definitions
// ============================================================================
//!
//! VirtIO レガシー（0.9.5）インターフェースの共通定数・構造体定義
//!
//! レガシーデバイスはFEATURES_OKを持たず、フィーチャーは下位32ビットのみ。
//! Virtqueueはディスクリプタテーブル・Availableリング・Usedリングを
//! 1つの連続領域に置き、Usedリングはページ境界（4096）に揃える。

// ============================================================================
// Device Status Bits
// ============================================================================

/// ステータスビット定数
pub mod status {
    /// 初期状態（リセット）
    pub const VIRTIO_STATUS_RESET: u8 = 0;
    /// ドライバがデバイスを認識した
    pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 1;
    /// ドライバがデバイスを駆動できる
    pub const VIRTIO_STATUS_DRIVER: u8 = 2;
    /// 駆動準備が整った
    pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
    /// ドライバがデバイスを放棄した
    pub const VIRTIO_STATUS_FAILED: u8 = 128;
}

// ============================================================================
// VirtQueue Constants
// ============================================================================

/// 最大キューサイズ（仕様上の制限）
pub const VIRTQUEUE_MAX_SIZE: u16 = 32768;

/// レガシーリングのアライメント
pub const VIRTIO_LEGACY_ALIGN: usize = 4096;

/// レガシーのキューアドレスはページフレーム番号で渡す
pub const VIRTIO_QUEUE_ADDR_SHIFT: u32 = 12;

// ============================================================================
// Descriptor Ring Structures
// ============================================================================

/// Virtqueueディスクリプタフラグ
pub mod vring_flags {
    /// チェーン内に次のディスクリプタがある
    pub const VRING_DESC_F_NEXT: u16 = 1;
    /// このバッファはデバイスが書き込む（ホスト→ゲスト）
    pub const VRING_DESC_F_WRITE: u16 = 2;
    /// 間接ディスクリプタテーブルを指す
    pub const VRING_DESC_F_INDIRECT: u16 = 4;
}

/// Availableリングフラグ
pub mod avail_flags {
    /// デバイスに割り込みを抑制させる
    pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
}

/// Usedリングフラグ
pub mod used_flags {
    /// デバイスが通知不要と宣言している
    pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
}

/// Virtqueueディスクリプタ
///
/// 各ディスクリプタはバッファの物理アドレス、長さ、フラグ、
/// およびチェーン内の次のディスクリプタへのインデックスを保持する。
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VringDesc {
    /// ゲスト物理アドレス
    pub addr: u64,
    /// バッファ長（バイト）
    pub len: u32,
    /// フラグ (NEXT, WRITE, INDIRECT)
    pub flags: u16,
    /// 次のディスクリプタインデックス（FLAG_NEXTが設定されている場合有効）
    pub next: u16,
}

impl VringDesc {
    /// 次のディスクリプタがあるか
    pub fn has_next(&self) -> bool {
        self.flags & vring_flags::VRING_DESC_F_NEXT != 0
    }

    /// デバイスが書き込むバッファか
    pub fn is_writable(&self) -> bool {
        self.flags & vring_flags::VRING_DESC_F_WRITE != 0
    }
}

/// Used要素
///
/// デバイスが処理を完了したバッファを示す。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VringUsedElem {
    /// ディスクリプタチェーンの先頭インデックス
    pub id: u32,
    /// 書き込まれたバイト数
    pub len: u32,
}

// ============================================================================
// Legacy Ring Layout
// ============================================================================

/// レガシーVirtqueueのメモリレイアウト
///
/// ```text
/// +0            desc[N]            16 * N
/// +avail        flags, idx, ring[N], used_event
/// (4096境界に切り上げ)
/// +used         flags, idx, ring[N]{id, len}, avail_event
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringLayout {
    /// キューサイズ
    pub size: u16,
    /// Availableリングのオフセット
    pub avail_offset: usize,
    /// Usedリングのオフセット
    pub used_offset: usize,
    /// 全体サイズ（アライメント込み）
    pub total_size: usize,
}

impl VringLayout {
    pub const fn new(size: u16) -> Self {
        let n = size as usize;
        let avail_offset = 16 * n;
        let avail_end = avail_offset + 2 * (3 + n);
        let used_offset = align_up(avail_end, VIRTIO_LEGACY_ALIGN);
        let used_end = used_offset + 2 * 3 + 8 * n;
        Self {
            size,
            avail_offset,
            used_offset,
            total_size: align_up(used_end, VIRTIO_LEGACY_ALIGN),
        }
    }

    /// avail.flags
    pub const fn avail_flags(&self) -> usize {
        self.avail_offset
    }

    /// avail.idx
    pub const fn avail_idx(&self) -> usize {
        self.avail_offset + 2
    }

    /// avail.ring[slot]
    pub const fn avail_ring(&self, slot: u16) -> usize {
        self.avail_offset + 4 + 2 * slot as usize
    }

    /// used.flags
    pub const fn used_flags(&self) -> usize {
        self.used_offset
    }

    /// used.idx
    pub const fn used_idx(&self) -> usize {
        self.used_offset + 2
    }

    /// used.ring[slot]
    pub const fn used_ring(&self, slot: u16) -> usize {
        self.used_offset + 4 + 8 * slot as usize
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ============================================================================
// Legacy PCI Register Offsets
// ============================================================================

/// レガシーPCIトランスポートのI/Oレジスタオフセット（BAR0）
pub mod legacy_pci {
    /// デバイスフィーチャー (R, 32bit)
    pub const HOST_FEATURES: u16 = 0x00;
    /// ドライバフィーチャー (RW, 32bit)
    pub const GUEST_FEATURES: u16 = 0x04;
    /// キューのページフレーム番号 (RW, 32bit)
    pub const QUEUE_PFN: u16 = 0x08;
    /// キューサイズ (R, 16bit)
    pub const QUEUE_NUM: u16 = 0x0C;
    /// キュー選択 (RW, 16bit)
    pub const QUEUE_SEL: u16 = 0x0E;
    /// キュー通知 (W, 16bit)
    pub const QUEUE_NOTIFY: u16 = 0x10;
    /// デバイスステータス (RW, 8bit)
    pub const STATUS: u16 = 0x12;
    /// ISRステータス (R, 8bit, 読み取りでクリア)
    pub const ISR: u16 = 0x13;
    /// MSI-X 設定変更ベクタ (RW, 16bit, MSI-X有効時のみ)
    pub const MSI_CONFIG_VECTOR: u16 = 0x14;
    /// MSI-X キューベクタ (RW, 16bit, MSI-X有効時のみ)
    pub const MSI_QUEUE_VECTOR: u16 = 0x16;
    /// デバイス設定の開始（MSI-X無効時）
    pub const CONFIG: u16 = 0x14;
    /// デバイス設定の開始（MSI-X有効時）
    pub const CONFIG_MSIX: u16 = 0x18;
}

/// ベクタ未割り当て
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

/// ISRビット
pub mod isr {
    /// キューに処理すべき要素がある
    pub const VIRTIO_ISR_QUEUE: u8 = 1;
    /// デバイス設定が変更された
    pub const VIRTIO_ISR_CONFIG: u8 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_256() {
        let layout = VringLayout::new(256);
        assert_eq!(layout.avail_offset, 4096);
        // 4096 + 2*(3+256) = 4614 -> 8192
        assert_eq!(layout.used_offset, 8192);
        assert_eq!(layout.used_ring(0), 8196);
        assert_eq!(layout.total_size, 8192 + 4096);
    }

    #[test]
    fn test_layout_small_queue() {
        let layout = VringLayout::new(8);
        assert_eq!(layout.avail_offset, 128);
        assert_eq!(layout.avail_ring(7), 128 + 4 + 14);
        assert_eq!(layout.used_offset, 4096);
        assert_eq!(layout.total_size, 8192);
    }

    #[test]
    fn test_desc_size() {
        assert_eq!(core::mem::size_of::<VringDesc>(), 16);
        assert_eq!(core::mem::size_of::<VringUsedElem>(), 8);
    }
}
