// ============================================================================
// src/io/virtio/transport.rs - VirtIO Transport Layer Abstraction
// ============================================================================
//!
//! # VirtIO トランスポート層抽象化
//!
//! ネットドライバは特定のバスに依存せず、[`VirtioTransport`] トレイトを
//! 通じてデバイスへアクセスする。
//!
//! ## 実装
//! - [`LegacyPciTransport`] - レガシーPCI（BAR0 I/O空間）
//! - `loopback::LoopbackTransport` - ソフトウェアデバイスモデル
//!
//! PCI列挙とケーパビリティ解析はこの層の外にあり、
//! [`PciDevice`] ハンドルとして受け取る。

use x86_64::PhysAddr;

use super::defs::{VIRTIO_MSI_NO_VECTOR, VIRTIO_QUEUE_ADDR_SHIFT, legacy_pci, status};

// ============================================================================
// Transport Error
// ============================================================================

/// トランスポート層エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// デバイスが見つからない
    DeviceNotFound,
    /// フィーチャーネゴシエーション失敗
    FeatureNegotiationFailed,
    /// キュー設定エラー
    QueueSetupFailed,
    /// 設定空間アクセスエラー
    ConfigAccessFailed,
    /// デバイスエラー（FAILEDビット）
    DeviceError,
    /// レガシーPFNで表現できないアドレス
    AddressOutOfRange,
    /// MSI-Xベクタを割り当てられない
    MsixUnavailable,
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::DeviceNotFound => write!(f, "device not found"),
            TransportError::FeatureNegotiationFailed => write!(f, "feature negotiation failed"),
            TransportError::QueueSetupFailed => write!(f, "queue setup failed"),
            TransportError::ConfigAccessFailed => write!(f, "config access failed"),
            TransportError::DeviceError => write!(f, "device reported failure"),
            TransportError::AddressOutOfRange => write!(f, "queue address out of range"),
            TransportError::MsixUnavailable => write!(f, "MSI-X vector unavailable"),
        }
    }
}

/// トランスポート結果型
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// VirtIO Transport Trait
// ============================================================================

/// VirtIOトランスポート層トレイト（レガシー）
///
/// フィーチャーは32ビット、キューサイズはデバイスが決める（変更不可）。
pub trait VirtioTransport: Send {
    /// デバイスステータスを取得
    fn get_status(&self) -> u8;

    /// デバイスステータスを設定
    fn set_status(&mut self, status: u8);

    /// デバイスをリセット
    fn reset(&mut self) {
        self.set_status(status::VIRTIO_STATUS_RESET);
    }

    /// デバイスフィーチャーを取得
    fn get_device_features(&self) -> u32;

    /// ドライバフィーチャーを設定
    fn set_driver_features(&mut self, features: u32);

    /// キューを選択
    fn select_queue(&mut self, queue_index: u16);

    /// 選択されたキューのサイズを取得（0 = 存在しない）
    fn get_queue_size(&self) -> u16;

    /// 選択されたキューのリング領域を設定（ゼロアドレスで無効化）
    fn set_queue_address(&mut self, addr: PhysAddr) -> TransportResult<()>;

    /// キューに通知
    fn notify_queue(&mut self, queue_index: u16);

    /// ISRを読む（読み取りでクリアされる）
    fn read_isr(&mut self) -> u8;

    /// デバイス設定空間の長さ
    fn device_config_len(&self) -> usize;

    /// コンフィグ空間から8ビット値を読み取り
    fn read_config_u8(&self, offset: usize) -> u8;

    /// コンフィグ空間から16ビット値を読み取り（ゲストネイティブ順）
    fn read_config_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.read_config_u8(offset), self.read_config_u8(offset + 1)])
    }

    /// MSI-X対応かどうか
    fn supports_msix(&self) -> bool {
        false
    }

    /// 選択されたキューにMSI-Xベクタを割り当て
    fn configure_queue_msix(&mut self, _queue_index: u16, _vector: u16) -> TransportResult<()> {
        Err(TransportError::MsixUnavailable)
    }

    /// 設定変更通知にMSI-Xベクタを割り当て
    fn configure_config_msix(&mut self, _vector: u16) -> TransportResult<()> {
        Err(TransportError::MsixUnavailable)
    }
}

// ============================================================================
// PCI Device Handle
// ============================================================================

/// PCIデバイスハンドル（BAR0 I/O空間）
///
/// 列挙・BAR割り当て・MSI-Xテーブル設定はPCI層が済ませている前提。
pub trait PciDevice: Send {
    /// 8ビット読み取り
    fn read8(&self, offset: u16) -> u8;

    /// 16ビット読み取り
    fn read16(&self, offset: u16) -> u16;

    /// 32ビット読み取り
    fn read32(&self, offset: u16) -> u32;

    /// 8ビット書き込み
    fn write8(&mut self, offset: u16, value: u8);

    /// 16ビット書き込み
    fn write16(&mut self, offset: u16, value: u16);

    /// 32ビット書き込み
    fn write32(&mut self, offset: u16, value: u32);

    /// I/O領域の長さ
    fn io_region_len(&self) -> usize;

    /// PCI層でMSI-Xが有効化されているか
    fn msix_enabled(&self) -> bool;
}

/// x86 I/Oポート経由のPCIデバイス
#[cfg(target_arch = "x86_64")]
pub struct PortIoDevice {
    base: u16,
    len: usize,
    msix: bool,
}

#[cfg(target_arch = "x86_64")]
impl PortIoDevice {
    /// # Safety
    /// `base..base+len` がこのデバイスのBAR0 I/O領域であること
    pub unsafe fn new(base: u16, len: usize, msix: bool) -> Self {
        Self { base, len, msix }
    }
}

#[cfg(target_arch = "x86_64")]
impl PciDevice for PortIoDevice {
    fn read8(&self, offset: u16) -> u8 {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.base + offset);
        // SAFETY: new() の契約によりポートはこのデバイスのもの
        unsafe { port.read() }
    }

    fn read16(&self, offset: u16) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.base + offset);
        // SAFETY: 同上
        unsafe { port.read() }
    }

    fn read32(&self, offset: u16) -> u32 {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.base + offset);
        // SAFETY: 同上
        unsafe { port.read() }
    }

    fn write8(&mut self, offset: u16, value: u8) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.base + offset);
        // SAFETY: 同上
        unsafe { port.write(value) }
    }

    fn write16(&mut self, offset: u16, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.base + offset);
        // SAFETY: 同上
        unsafe { port.write(value) }
    }

    fn write32(&mut self, offset: u16, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.base + offset);
        // SAFETY: 同上
        unsafe { port.write(value) }
    }

    fn io_region_len(&self) -> usize {
        self.len
    }

    fn msix_enabled(&self) -> bool {
        self.msix
    }
}

// ============================================================================
// Legacy PCI Transport Implementation
// ============================================================================

/// VirtIO PCI トランスポート（レガシー）
pub struct LegacyPciTransport<D: PciDevice> {
    device: D,
    /// 選択中のキュー
    selected_queue: u16,
}

impl<D: PciDevice> LegacyPciTransport<D> {
    pub fn new(device: D) -> TransportResult<Self> {
        if device.io_region_len() < legacy_pci::CONFIG as usize {
            return Err(TransportError::DeviceNotFound);
        }
        Ok(Self {
            device,
            selected_queue: 0,
        })
    }

    /// デバイス設定の開始オフセット（MSI-X有無で変わる）
    fn config_base(&self) -> u16 {
        if self.device.msix_enabled() {
            legacy_pci::CONFIG_MSIX
        } else {
            legacy_pci::CONFIG
        }
    }

    /// 内部のPCIデバイスを取得
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: PciDevice> VirtioTransport for LegacyPciTransport<D> {
    fn get_status(&self) -> u8 {
        self.device.read8(legacy_pci::STATUS)
    }

    fn set_status(&mut self, status: u8) {
        self.device.write8(legacy_pci::STATUS, status);
    }

    fn get_device_features(&self) -> u32 {
        self.device.read32(legacy_pci::HOST_FEATURES)
    }

    fn set_driver_features(&mut self, features: u32) {
        self.device.write32(legacy_pci::GUEST_FEATURES, features);
    }

    fn select_queue(&mut self, queue_index: u16) {
        self.selected_queue = queue_index;
        self.device.write16(legacy_pci::QUEUE_SEL, queue_index);
    }

    fn get_queue_size(&self) -> u16 {
        self.device.read16(legacy_pci::QUEUE_NUM)
    }

    fn set_queue_address(&mut self, addr: PhysAddr) -> TransportResult<()> {
        let pfn = addr.as_u64() >> VIRTIO_QUEUE_ADDR_SHIFT;
        if pfn > u32::MAX as u64 || addr.as_u64() & ((1 << VIRTIO_QUEUE_ADDR_SHIFT) - 1) != 0 {
            return Err(TransportError::AddressOutOfRange);
        }
        self.device.write32(legacy_pci::QUEUE_PFN, pfn as u32);
        Ok(())
    }

    fn notify_queue(&mut self, queue_index: u16) {
        self.device.write16(legacy_pci::QUEUE_NOTIFY, queue_index);
    }

    fn read_isr(&mut self) -> u8 {
        self.device.read8(legacy_pci::ISR)
    }

    fn device_config_len(&self) -> usize {
        self.device
            .io_region_len()
            .saturating_sub(self.config_base() as usize)
    }

    fn read_config_u8(&self, offset: usize) -> u8 {
        self.device.read8(self.config_base() + offset as u16)
    }

    fn supports_msix(&self) -> bool {
        self.device.msix_enabled()
    }

    fn configure_queue_msix(&mut self, queue_index: u16, vector: u16) -> TransportResult<()> {
        if !self.device.msix_enabled() {
            return Err(TransportError::MsixUnavailable);
        }
        self.select_queue(queue_index);
        self.device.write16(legacy_pci::MSI_QUEUE_VECTOR, vector);
        // デバイスは割り当てられなかったベクタをNO_VECTORとして返す
        if self.device.read16(legacy_pci::MSI_QUEUE_VECTOR) == VIRTIO_MSI_NO_VECTOR
            && vector != VIRTIO_MSI_NO_VECTOR
        {
            return Err(TransportError::MsixUnavailable);
        }
        Ok(())
    }

    fn configure_config_msix(&mut self, vector: u16) -> TransportResult<()> {
        if !self.device.msix_enabled() {
            return Err(TransportError::MsixUnavailable);
        }
        self.device.write16(legacy_pci::MSI_CONFIG_VECTOR, vector);
        if self.device.read16(legacy_pci::MSI_CONFIG_VECTOR) == VIRTIO_MSI_NO_VECTOR
            && vector != VIRTIO_MSI_NO_VECTOR
        {
            return Err(TransportError::MsixUnavailable);
        }
        Ok(())
    }
}

// ============================================================================
// Device Initialization Helper
// ============================================================================

/// デバイス初期化ヘルパー（レガシーハンドシェイク）
///
/// レガシーデバイスにはFEATURES_OKがないため、フィーチャーを書いた時点で
/// ネゴシエーションは完了する。
pub struct VirtioDeviceInit<'a, T: VirtioTransport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: VirtioTransport + ?Sized> VirtioDeviceInit<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// リセット → ACKNOWLEDGE → DRIVER → フィーチャーネゴシエーション
    ///
    /// デバイスが提供するフィーチャーと `wanted` の積を書き込み、それを返す。
    pub fn initialize(&mut self, wanted: u32) -> TransportResult<u32> {
        // 1. デバイスをリセット
        self.transport.reset();

        // 2. ACKNOWLEDGE を設定
        self.transport.set_status(status::VIRTIO_STATUS_ACKNOWLEDGE);

        // 3. DRIVER を設定
        let current_status = self.transport.get_status() | status::VIRTIO_STATUS_DRIVER;
        self.transport.set_status(current_status);

        // 4. フィーチャーネゴシエーション
        let device_features = self.transport.get_device_features();
        let negotiated = device_features & wanted;
        self.transport.set_driver_features(negotiated);

        if self.transport.get_status() & status::VIRTIO_STATUS_FAILED != 0 {
            return Err(TransportError::FeatureNegotiationFailed);
        }

        Ok(negotiated)
    }

    /// DRIVER_OK を設定してデバイスを使用可能にする
    pub fn finish_init(&mut self) -> TransportResult<()> {
        let current_status = self.transport.get_status() | status::VIRTIO_STATUS_DRIVER_OK;
        self.transport.set_status(current_status);

        // デバイスがエラー状態でないことを確認
        if self.transport.get_status() & status::VIRTIO_STATUS_FAILED != 0 {
            return Err(TransportError::DeviceError);
        }

        Ok(())
    }

    /// 初期化失敗をデバイスに通知
    pub fn fail(&mut self) {
        let current_status = self.transport.get_status() | status::VIRTIO_STATUS_FAILED;
        self.transport.set_status(current_status);
    }
}

// ============================================================================
// Tests
// ============================================================================
