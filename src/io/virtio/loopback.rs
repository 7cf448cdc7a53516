// ============================================================================
// src/io/virtio/loopback.rs - Software VirtIO-Net Device Model
// ============================================================================
//!
//! ソフトウェアで実装したレガシーvirtio-netデバイス
//!
//! ハイパーバイザのバックエンドと同じく、ドライバが設定したリング領域の
//! Availableリングを読み、Usedリングへ書き込む。ドライバと同じアドレス空間で
//! 動くため、物理アドレスはそのまま仮想アドレスとして扱う（恒等マッピング）。
//!
//! [`LoopbackDevice`] がデバイス側の操作（受信フレームの注入、送信の完了、
//! リンク状態の変更）を、[`LoopbackTransport`] がドライバ側のレジスタを提供する。
//! 両者は同じ状態を共有する。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};
use hashbrown::HashMap;
use spin::Mutex;
use x86_64::PhysAddr;

use super::defs::*;
use super::net::NetFeatures;
use super::net::config::ctrl_queue_index;
use super::net::ctrl::VIRTIO_NET_OK;
use super::transport::{TransportError, TransportResult, VirtioTransport};

/// 設定空間の長さ（mac, status, max_virtqueue_pairs）
const CONFIG_LEN: usize = 10;

/// 送信完了したフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    /// 先頭ディスクリプタ（virtio-netヘッダ）
    pub header: Vec<u8>,
    /// 残りのディスクリプタを連結したもの
    pub payload: Vec<u8>,
}

/// 受け付けた制御コマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlRecord {
    pub class: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

/// キューごとの状態
struct QueueState {
    size: u16,
    /// リング領域（未設定ならNone）
    addr: Option<u64>,
    /// 次に読むAvailableインデックス
    last_avail: u16,
    vector: u16,
}

struct LoopbackState {
    status: u8,
    device_features: u32,
    driver_features: u32,
    selected: u16,
    queue_size: u16,
    ctrl_queue_size: u16,
    max_queue_pairs: u16,
    queues: HashMap<u16, QueueState>,
    config: Vec<u8>,
    isr: u8,
    msix: bool,
    msix_fails: bool,
    config_vector: u16,
    notifications: HashMap<u16, u32>,
    ctrl_log: Vec<CtrlRecord>,
    ctrl_ack: u8,
    resets: u32,
}

// ============================================================================
// Shared memory access
// ============================================================================

/// ドライバのメモリを読む
///
/// # Safety
/// `addr` から `out.len()` バイトがドライバから公開された有効な領域であること
unsafe fn mem_read(addr: u64, out: &mut [u8]) {
    unsafe { core::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), out.len()) }
}

/// ドライバのメモリに書く
///
/// # Safety
/// `addr` から `data.len()` バイトがデバイス書き込み可能として公開された領域であること
unsafe fn mem_write(addr: u64, data: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) }
}

/// デバイス側から見たリング
struct Ring {
    base: u64,
    layout: VringLayout,
}

impl Ring {
    fn read_u16(&self, offset: usize) -> u16 {
        // SAFETY: リング領域はset_queue_addressで渡され、ドライバが保持している
        unsafe { core::ptr::read_volatile((self.base + offset as u64) as *const u16) }
    }

    fn write_u16(&self, offset: usize, value: u16) {
        // SAFETY: 同上
        unsafe { core::ptr::write_volatile((self.base + offset as u64) as *mut u16, value) }
    }

    fn read_desc(&self, idx: u16) -> VringDesc {
        // SAFETY: idx < size
        unsafe { core::ptr::read_volatile((self.base + 16 * idx as u64) as *const VringDesc) }
    }

    fn write_used(&self, slot: u16, elem: VringUsedElem) {
        let addr = self.base + self.layout.used_ring(slot) as u64;
        // SAFETY: used.ring[slot] は領域内
        unsafe { core::ptr::write_volatile(addr as *mut VringUsedElem, elem) }
    }
}

impl LoopbackState {
    fn mergeable(&self) -> bool {
        self.driver_features & NetFeatures::MRG_RXBUF.bits() != 0
    }

    /// 制御キューの位置（16ビットに収まらなければNone）
    fn ctrl_index(&self) -> Option<u16> {
        ctrl_queue_index(
            NetFeatures::from_bits_retain(self.driver_features),
            self.max_queue_pairs,
        )
        .ok()
    }

    fn ring(&self, q: u16) -> Option<Ring> {
        let qs = self.queues.get(&q)?;
        Some(Ring {
            base: qs.addr?,
            layout: VringLayout::new(qs.size),
        })
    }

    /// Availableリングに残っているチェーン数
    fn avail_pending(&self, q: u16) -> usize {
        let (Some(ring), Some(qs)) = (self.ring(q), self.queues.get(&q)) else {
            return 0;
        };
        ring.read_u16(ring.layout.avail_idx())
            .wrapping_sub(qs.last_avail) as usize
    }

    /// 次のチェーンを取り出す
    fn pop_avail(&mut self, q: u16) -> Option<(u16, Vec<VringDesc>)> {
        let ring = self.ring(q)?;
        let qs = self.queues.get_mut(&q)?;
        if ring.read_u16(ring.layout.avail_idx()) == qs.last_avail {
            return None;
        }
        fence(Ordering::Acquire);

        let slot = qs.last_avail % qs.size;
        let head = ring.read_u16(ring.layout.avail_ring(slot));
        qs.last_avail = qs.last_avail.wrapping_add(1);

        let mut chain = Vec::new();
        let mut idx = head;
        for _ in 0..qs.size {
            let desc = ring.read_desc(idx);
            chain.push(desc);
            if !desc.has_next() {
                break;
            }
            idx = desc.next;
        }
        Some((head, chain))
    }

    /// Usedリングに返す
    fn push_used(&mut self, q: u16, head: u16, len: u32) {
        let Some(ring) = self.ring(q) else {
            return;
        };
        let used_idx = ring.read_u16(ring.layout.used_idx());
        ring.write_used(
            used_idx % ring.layout.size,
            VringUsedElem {
                id: head as u32,
                len,
            },
        );
        fence(Ordering::Release);
        ring.write_u16(ring.layout.used_idx(), used_idx.wrapping_add(1));
        self.isr |= isr::VIRTIO_ISR_QUEUE;
    }

    /// 先頭バッファに書いてUsedに返す
    fn fill_rx(&mut self, bytes: &[u8], used_len: u32) -> bool {
        let Some((head, chain)) = self.pop_avail(0) else {
            return false;
        };
        let Some(desc) = chain.first().filter(|d| d.is_writable()) else {
            self.push_used(0, head, 0);
            return false;
        };
        let n = bytes.len().min(desc.len as usize);
        // SAFETY: デバイス書き込み可能として公開された区間
        unsafe { mem_write(desc.addr, &bytes[..n]) };
        self.push_used(0, head, used_len);
        true
    }

    fn process_ctrl(&mut self, q: u16) {
        while let Some((head, chain)) = self.pop_avail(q) {
            let Some((ack, readable)) = chain.split_last() else {
                continue;
            };
            let mut bytes = Vec::new();
            for desc in readable {
                let start = bytes.len();
                bytes.resize(start + desc.len as usize, 0);
                // SAFETY: ドライバが読み取り用に公開した区間
                unsafe { mem_read(desc.addr, &mut bytes[start..]) };
            }
            if bytes.len() >= 2 && ack.is_writable() {
                self.ctrl_log.push(CtrlRecord {
                    class: bytes[0],
                    command: bytes[1],
                    data: bytes[2..].to_vec(),
                });
                // SAFETY: ackはデバイス書き込み可能
                unsafe { mem_write(ack.addr, &[self.ctrl_ack]) };
            }
            self.push_used(q, head, 1);
        }
    }

    fn reset(&mut self) {
        self.status = status::VIRTIO_STATUS_RESET;
        self.driver_features = 0;
        self.queues.clear();
        self.isr = 0;
        self.config_vector = VIRTIO_MSI_NO_VECTOR;
        self.resets += 1;
    }
}

// ============================================================================
// Device side
// ============================================================================

/// デバイスの構成
pub struct LoopbackBuilder {
    mac: [u8; 6],
    link_up: bool,
    max_queue_pairs: u16,
    config_len: usize,
    features: NetFeatures,
    queue_size: u16,
    ctrl_queue_size: u16,
    msix: bool,
    msix_fails: bool,
    ctrl_ack: u8,
}

impl LoopbackBuilder {
    pub fn mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    pub fn link_up(mut self, up: bool) -> Self {
        self.link_up = up;
        self
    }

    /// 2以上ならMQを提供する
    pub fn max_queue_pairs(mut self, pairs: u16) -> Self {
        self.max_queue_pairs = pairs;
        if pairs > 1 {
            self.features |= NetFeatures::MQ;
        }
        self
    }

    /// 設定空間の長さを切り詰める
    pub fn config_len(mut self, len: usize) -> Self {
        self.config_len = len.min(CONFIG_LEN);
        self
    }

    /// 提供するフィーチャー
    pub fn features(mut self, features: NetFeatures) -> Self {
        self.features = features;
        self
    }

    /// データキューのサイズ
    pub fn queue_size(mut self, size: u16) -> Self {
        self.queue_size = size;
        self
    }

    pub fn msix(mut self, enabled: bool) -> Self {
        self.msix = enabled;
        self
    }

    /// ベクタの割り当てを拒否する
    pub fn msix_fails(mut self, fails: bool) -> Self {
        self.msix_fails = fails;
        self
    }

    /// 制御コマンドに返すack
    pub fn ctrl_ack(mut self, ack: u8) -> Self {
        self.ctrl_ack = ack;
        self
    }

    pub fn build(self) -> LoopbackDevice {
        let mut config = Vec::with_capacity(CONFIG_LEN);
        config.extend_from_slice(&self.mac);
        config.extend_from_slice(&(self.link_up as u16).to_le_bytes());
        config.extend_from_slice(&self.max_queue_pairs.to_le_bytes());
        config.truncate(self.config_len);

        LoopbackDevice {
            state: Arc::new(Mutex::new(LoopbackState {
                status: status::VIRTIO_STATUS_RESET,
                device_features: self.features.bits(),
                driver_features: 0,
                selected: 0,
                queue_size: self.queue_size,
                ctrl_queue_size: self.ctrl_queue_size,
                max_queue_pairs: self.max_queue_pairs,
                queues: HashMap::new(),
                config,
                isr: 0,
                msix: self.msix,
                msix_fails: self.msix_fails,
                config_vector: VIRTIO_MSI_NO_VECTOR,
                notifications: HashMap::new(),
                ctrl_log: Vec::new(),
                ctrl_ack: self.ctrl_ack,
                resets: 0,
            })),
        }
    }
}

/// ソフトウェアvirtio-netデバイス
#[derive(Clone)]
pub struct LoopbackDevice {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackDevice {
    pub fn builder() -> LoopbackBuilder {
        LoopbackBuilder {
            mac: [0x52, 0x54, 0x00, 0x00, 0x00, 0x01],
            link_up: true,
            max_queue_pairs: 1,
            config_len: CONFIG_LEN,
            features: NetFeatures::MAC
                | NetFeatures::STATUS
                | NetFeatures::CTRL_VQ
                | NetFeatures::CTRL_RX
                | NetFeatures::CTRL_MAC_ADDR
                | NetFeatures::GUEST_ANNOUNCE,
            queue_size: 16,
            ctrl_queue_size: 8,
            msix: false,
            msix_fails: false,
            ctrl_ack: VIRTIO_NET_OK,
        }
    }

    /// ドライバ側のレジスタ
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            state: self.state.clone(),
        }
    }

    /// 受信フレームを注入する（ヘッダはネゴシエート結果に合わせて付ける）
    ///
    /// ポスト済みバッファがなければ `false`。
    pub fn deliver_rx(&self, frame: &[u8]) -> bool {
        let mut state = self.state.lock();
        let mergeable = state.mergeable();
        let hsize = if mergeable { 12 } else { 10 };
        let mut bytes = alloc::vec![0u8; hsize];
        if mergeable {
            bytes[10..12].copy_from_slice(&1u16.to_le_bytes());
        }
        bytes.extend_from_slice(frame);
        let len = bytes.len() as u32;
        state.fill_rx(&bytes, len)
    }

    /// 任意のバイト列と使用長を返す（不正なフレームの再現用）
    pub fn deliver_rx_raw(&self, bytes: &[u8], used_len: u32) -> bool {
        self.state.lock().fill_rx(bytes, used_len)
    }

    /// マージ受信で `buffers` 個のバッファに分けて注入する
    pub fn deliver_rx_merged(&self, frame: &[u8], buffers: u16) -> bool {
        let mut state = self.state.lock();
        if !state.mergeable() || buffers == 0 || state.avail_pending(0) < buffers as usize {
            return false;
        }
        let mut bytes = alloc::vec![0u8; 12];
        bytes[10..12].copy_from_slice(&buffers.to_le_bytes());
        bytes.extend_from_slice(frame);

        let chunk = bytes.len().div_ceil(buffers as usize);
        for part in bytes.chunks(chunk) {
            if !state.fill_rx(part, part.len() as u32) {
                return false;
            }
        }
        true
    }

    /// 送信キューのチェーンを最大 `max` 個処理してフレームを返す
    pub fn complete_tx(&self, queue: u16, max: usize) -> Vec<TxFrame> {
        let mut state = self.state.lock();
        let mut frames = Vec::new();
        while frames.len() < max {
            let Some((head, chain)) = state.pop_avail(queue) else {
                break;
            };
            let mut parts = chain.iter().map(|desc| {
                let mut buf = alloc::vec![0u8; desc.len as usize];
                // SAFETY: ドライバが読み取り用に公開した区間
                unsafe { mem_read(desc.addr, &mut buf) };
                buf
            });
            let header = parts.next().unwrap_or_default();
            let payload = parts.flatten().collect();
            frames.push(TxFrame { header, payload });
            state.push_used(queue, head, 0);
        }
        frames
    }

    /// Availableリングに残っているチェーン数
    pub fn avail_pending(&self, queue: u16) -> usize {
        self.state.lock().avail_pending(queue)
    }

    /// リンク状態を変え、設定変更割り込みを立てる
    pub fn set_link(&self, up: bool) {
        self.update_status(|s| if up { s | 1 } else { s & !1 });
    }

    /// 告知要求ビットを変える
    pub fn set_announce(&self, on: bool) {
        self.update_status(|s| if on { s | 2 } else { s & !2 });
    }

    fn update_status(&self, f: impl FnOnce(u16) -> u16) {
        let mut state = self.state.lock();
        if state.config.len() < 8 {
            return;
        }
        let old = u16::from_le_bytes([state.config[6], state.config[7]]);
        state.config[6..8].copy_from_slice(&f(old).to_le_bytes());
        state.isr |= isr::VIRTIO_ISR_CONFIG;
    }

    /// キューへの通知回数
    pub fn notifications(&self, queue: u16) -> u32 {
        self.state.lock().notifications.get(&queue).copied().unwrap_or(0)
    }

    /// 受け付けた制御コマンド
    pub fn ctrl_commands(&self) -> Vec<CtrlRecord> {
        self.state.lock().ctrl_log.clone()
    }

    /// デバイスステータス
    pub fn status(&self) -> u8 {
        self.state.lock().status
    }

    /// ドライバが書いたフィーチャー
    pub fn driver_features(&self) -> NetFeatures {
        NetFeatures::from_bits_retain(self.state.lock().driver_features)
    }

    /// キューのMSI-Xベクタ
    pub fn queue_vector(&self, queue: u16) -> Option<u16> {
        self.state.lock().queues.get(&queue).map(|q| q.vector)
    }

    /// 設定変更のMSI-Xベクタ
    pub fn config_vector(&self) -> u16 {
        self.state.lock().config_vector
    }

    /// リング領域が設定されているか
    pub fn queue_attached(&self, queue: u16) -> bool {
        self.state
            .lock()
            .queues
            .get(&queue)
            .is_some_and(|q| q.addr.is_some())
    }

    /// リセット回数
    pub fn reset_count(&self) -> u32 {
        self.state.lock().resets
    }
}

// ============================================================================
// Driver side
// ============================================================================

/// ループバックデバイスのトランスポート
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl VirtioTransport for LoopbackTransport {
    fn get_status(&self) -> u8 {
        self.state.lock().status
    }

    fn set_status(&mut self, status: u8) {
        let mut state = self.state.lock();
        if status == status::VIRTIO_STATUS_RESET {
            state.reset();
        } else {
            state.status = status;
        }
    }

    fn get_device_features(&self) -> u32 {
        self.state.lock().device_features
    }

    fn set_driver_features(&mut self, features: u32) {
        let mut state = self.state.lock();
        state.driver_features = features & state.device_features;
    }

    fn select_queue(&mut self, queue_index: u16) {
        self.state.lock().selected = queue_index;
    }

    fn get_queue_size(&self) -> u16 {
        let state = self.state.lock();
        let q = state.selected;
        if u32::from(q) < 2 * u32::from(state.max_queue_pairs) {
            state.queue_size
        } else if Some(q) == state.ctrl_index()
            && state.device_features & NetFeatures::CTRL_VQ.bits() != 0
        {
            state.ctrl_queue_size
        } else {
            0
        }
    }

    fn set_queue_address(&mut self, addr: PhysAddr) -> TransportResult<()> {
        let size = self.get_queue_size();
        let mut state = self.state.lock();
        let q = state.selected;
        if addr.is_null() {
            state.queues.remove(&q);
            return Ok(());
        }
        if size == 0 {
            return Err(TransportError::QueueSetupFailed);
        }
        if addr.as_u64() % VIRTIO_LEGACY_ALIGN as u64 != 0 {
            return Err(TransportError::AddressOutOfRange);
        }
        state.queues.insert(
            q,
            QueueState {
                size,
                addr: Some(addr.as_u64()),
                last_avail: 0,
                vector: VIRTIO_MSI_NO_VECTOR,
            },
        );
        Ok(())
    }

    fn notify_queue(&mut self, queue_index: u16) {
        let mut state = self.state.lock();
        *state.notifications.entry(queue_index).or_insert(0) += 1;
        if Some(queue_index) == state.ctrl_index() {
            state.process_ctrl(queue_index);
        }
    }

    fn read_isr(&mut self) -> u8 {
        core::mem::take(&mut self.state.lock().isr)
    }

    fn device_config_len(&self) -> usize {
        self.state.lock().config.len()
    }

    fn read_config_u8(&self, offset: usize) -> u8 {
        self.state.lock().config.get(offset).copied().unwrap_or(0)
    }

    fn supports_msix(&self) -> bool {
        self.state.lock().msix
    }

    fn configure_queue_msix(&mut self, queue_index: u16, vector: u16) -> TransportResult<()> {
        let mut state = self.state.lock();
        if !state.msix || state.msix_fails {
            return Err(TransportError::MsixUnavailable);
        }
        let q = state
            .queues
            .get_mut(&queue_index)
            .ok_or(TransportError::QueueSetupFailed)?;
        q.vector = vector;
        Ok(())
    }

    fn configure_config_msix(&mut self, vector: u16) -> TransportResult<()> {
        let mut state = self.state.lock();
        if !state.msix || state.msix_fails {
            return Err(TransportError::MsixUnavailable);
        }
        state.config_vector = vector;
        Ok(())
    }
}

/// テスト用: キューを割り当ててデバイスに登録する
#[cfg(test)]
pub(crate) fn attach_queue<T>(
    transport: &mut LoopbackTransport,
    index: u16,
) -> super::virtqueue::Virtqueue<T> {
    transport.select_queue(index);
    let size = transport.get_queue_size();
    let vq = super::virtqueue::Virtqueue::new(index, size).unwrap();
    transport.set_queue_address(vq.phys_addr()).unwrap();
    vq
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_sizes() {
        let device = LoopbackDevice::builder().queue_size(32).build();
        let mut t = device.transport();
        t.select_queue(0);
        assert_eq!(t.get_queue_size(), 32);
        t.select_queue(2);
        assert_eq!(t.get_queue_size(), 8);
        t.select_queue(3);
        assert_eq!(t.get_queue_size(), 0);
    }

    #[test]
    fn test_reset_detaches_queues() {
        let device = LoopbackDevice::builder().build();
        let mut t = device.transport();
        let _vq = attach_queue::<u32>(&mut t, 0);
        assert!(device.queue_attached(0));
        t.reset();
        assert!(!device.queue_attached(0));
        assert_eq!(device.reset_count(), 1);
    }

    #[test]
    fn test_unaligned_queue_address_rejected() {
        let device = LoopbackDevice::builder().build();
        let mut t = device.transport();
        t.select_queue(0);
        assert_eq!(
            t.set_queue_address(PhysAddr::new(0x1234)),
            Err(TransportError::AddressOutOfRange)
        );
    }

    #[test]
    fn test_isr_read_clears() {
        let device = LoopbackDevice::builder().build();
        let mut t = device.transport();
        device.set_link(false);
        assert_eq!(t.read_isr(), isr::VIRTIO_ISR_CONFIG);
        assert_eq!(t.read_isr(), 0);
        assert_eq!(t.read_config_u16(6), 0);
    }
}
