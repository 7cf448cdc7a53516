// ============================================================================
// src/io/virtio/net/mod.rs - VirtIO Network Device Driver (Legacy)
// ============================================================================
//!
//! # VirtIO-Net ドライバ（レガシーインターフェース）
//!
//! レガシーPCIトランスポート上のvirtio-netデバイスを駆動し、
//! 上位ネットワークスタックに [`Nic`] として見せる。
//!
//! ## 構成
//! - `header`: virtio-netヘッダのエンコード/デコード
//! - `rx` / `tx` / `ctrl`: キューごとの管理
//! - `irq`: 割り込み発生源の判定
//! - `kick`: デバイス通知のtick単位バッチ化
//! - `config`: デバイス設定空間
//!
//! ## 割り込みとロック
//! 各キューの状態は [`IrqMutex`] で保護する。ロックは常に
//! 「キュー → トランスポート」の順で取り、逆順に入れ子にしない。
//! 上位のハンドラはロックを外してから呼び出すので、ハンドラ内から
//! `transmit` 等を呼んでもよい。同じキューのサービスが入れ子になった場合は
//! [`ServiceGate`] が実行中のサービスにもう一周させる。

pub mod config;
pub mod ctrl;
pub mod header;
pub mod irq;
pub mod kick;
pub mod rx;
pub mod tx;

use alloc::sync::{Arc, Weak};
use bitflags::bitflags;

use self::config::{DeviceConfig, ctrl_queue_index};
use self::ctrl::{CtrlCommand, CtrlQueue, VIRTIO_NET_OK};
use self::header::HeaderLayout;
use self::irq::{IrqMode, IrqSource, config_events, vector};
use self::kick::KickScheduler;
use self::rx::RxQueue;
use self::tx::{TxOutcome, TxQueue};
use super::transport::{TransportResult, VirtioDeviceInit, VirtioTransport};
use super::virtqueue::Virtqueue;
use crate::error::{ConfigError, CtrlError, DriverError, DriverResult, QueueError};
use crate::net::ethernet::MacAddress;
use crate::net::mempool::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::net::nic::{
    LinkHandler, Nic, NicStats, ReceiveHandler, TxAvailableHandler,
};
use crate::net::packet::Packet;
use crate::sync::{IrqMutex, ServiceGate};
use crate::task::interrupt_waker::IrqEventChannel;
use crate::task::tick::{DeferredWork, TickDispatcher};

// ============================================================================
// Feature Bits
// ============================================================================

bitflags! {
    /// VirtIO-Net フィーチャービット（レガシーは下位32ビットのみ）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetFeatures: u32 {
        /// デバイスがチェックサムを計算できる
        const CSUM = 1 << 0;
        /// ゲストがチェックサム未計算のパケットを受け取れる
        const GUEST_CSUM = 1 << 1;
        /// 設定空間にMACアドレスがある
        const MAC = 1 << 5;
        /// マージ受信バッファ
        const MRG_RXBUF = 1 << 15;
        /// 設定空間にリンク状態がある
        const STATUS = 1 << 16;
        /// 制御キュー
        const CTRL_VQ = 1 << 17;
        /// 受信モード制御
        const CTRL_RX = 1 << 18;
        /// VLANフィルタ
        const CTRL_VLAN = 1 << 19;
        /// ゲストによる告知
        const GUEST_ANNOUNCE = 1 << 21;
        /// マルチキュー
        const MQ = 1 << 22;
        /// 制御キューによるMACアドレス設定
        const CTRL_MAC_ADDR = 1 << 23;
    }
}

/// 受信キュー番号
pub const VIRTQUEUE_RX: u16 = 0;
/// 送信キュー番号
pub const VIRTQUEUE_TX: u16 = 1;

/// MTU
pub const VIRTIO_NET_MTU: u16 = crate::net::ethernet::ETH_MTU;

// ============================================================================
// Configuration
// ============================================================================

/// ドライバ設定
#[derive(Debug, Clone)]
pub struct VirtioNetConfig {
    /// デバイス名
    pub name: &'static str,
    /// 要求するフィーチャー
    pub features: NetFeatures,
    /// 受信バッファ長（ヘッダ込み）
    pub rx_buffer_size: usize,
    /// 送信待ちFIFOの上限
    pub tx_pending_limit: usize,
    /// MSI-Xを使うか
    pub use_msix: bool,
}

impl Default for VirtioNetConfig {
    fn default() -> Self {
        Self {
            name: "virtio-net",
            features: NetFeatures::MAC
                | NetFeatures::MRG_RXBUF
                | NetFeatures::STATUS
                | NetFeatures::CTRL_VQ
                | NetFeatures::CTRL_RX
                | NetFeatures::GUEST_ANNOUNCE
                | NetFeatures::MQ
                | NetFeatures::CTRL_MAC_ADDR,
            rx_buffer_size: DEFAULT_BUFFER_SIZE,
            tx_pending_limit: 256,
            use_msix: true,
        }
    }
}

// ============================================================================
// Shared device state
// ============================================================================

/// 割り込みハンドラ・tick終了処理・呼び出し側で共有する状態
struct NetShared<T: VirtioTransport> {
    name: &'static str,
    transport: IrqMutex<T>,
    rx: IrqMutex<RxQueue>,
    tx: IrqMutex<TxQueue>,
    ctrl: IrqMutex<Option<CtrlQueue>>,
    config: IrqMutex<DeviceConfig>,
    rx_gate: ServiceGate,
    tx_gate: ServiceGate,
    kick: KickScheduler,
    stats: Arc<NicStats>,
    rx_handler: IrqMutex<Option<ReceiveHandler>>,
    tx_available_handler: IrqMutex<Option<TxAvailableHandler>>,
    link_handler: IrqMutex<Option<LinkHandler>>,
    events: IrqEventChannel,
    mode: IrqMode,
    features: NetFeatures,
    layout: HeaderLayout,
}

/// ハンドラを一時的に取り出して呼ぶ
///
/// 呼び出し中に新しいハンドラが登録された場合はそちらを残す。
fn with_handler<H>(slot: &IrqMutex<Option<H>>, f: impl FnOnce(&mut H)) -> bool {
    let Some(mut handler) = slot.lock().take() else {
        return false;
    };
    f(&mut handler);
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(handler);
    }
    true
}

impl<T: VirtioTransport> NetShared<T> {
    fn dispatch(&self, sources: IrqSource) {
        if sources.contains(IrqSource::RX) {
            self.service_rx();
        }
        if sources.contains(IrqSource::TX) {
            self.service_tx();
        }
        if sources.contains(IrqSource::CONFIG) {
            self.config_changed();
        }
    }

    /// 受信キューのサービス
    fn service_rx(&self) {
        if !self.rx_gate.enter() {
            return;
        }
        loop {
            let mut packets = self.rx.lock().drain();
            if !packets.is_empty() {
                with_handler(&self.rx_handler, |handler| {
                    for packet in packets.drain(..) {
                        self.stats.count_rx(packet.len());
                        handler(packet);
                    }
                });
                // ハンドラ未登録
                for _ in packets.drain(..) {
                    self.stats.count_rx_drop();
                }
            }

            let (more, unkicked) = {
                let mut rx = self.rx.lock();
                (rx.refill(), rx.has_unkicked())
            };
            if unkicked {
                self.kick.request_kick();
            }
            if more {
                continue;
            }
            if self.rx_gate.leave() {
                break;
            }
        }
    }

    /// 送信キューのサービス
    fn service_tx(&self) {
        if !self.tx_gate.enter() {
            return;
        }
        loop {
            let (result, available, unkicked) = {
                let mut tx = self.tx.lock();
                let result = tx.service();
                (result, tx.available(), tx.has_unkicked())
            };
            if unkicked {
                self.kick.request_kick();
            }
            if result.reclaimed > 0 {
                with_handler(&self.tx_available_handler, |handler| handler(available));
            }
            if self.tx_gate.leave() {
                break;
            }
        }
    }

    /// 設定変更割り込み
    fn config_changed(&self) {
        let read = DeviceConfig::read(&*self.transport.lock(), self.features);
        let mut new = match read {
            Ok(config) => config,
            Err(e) => {
                log::warn!("[VIRTIO-NET] {}: config re-read failed: {}", self.name, e);
                return;
            }
        };

        let old = {
            let mut config = self.config.lock();
            // MACは制御キューで変更した値を保持する
            new.mac = config.mac;
            core::mem::replace(&mut *config, new)
        };

        let announce = self.features.contains(NetFeatures::GUEST_ANNOUNCE);
        for event in config_events(&old, &new, announce) {
            log::info!("[VIRTIO-NET] {}: {:?}", self.name, event);
            with_handler(&self.link_handler, |handler| handler(event));
        }
    }

    /// 遅延キックの実行
    fn flush_kicks(&self) {
        let rx_kick = self.rx.lock().take_kick();
        if rx_kick {
            self.transport.lock().notify_queue(VIRTQUEUE_RX);
        }
        let tx_kick = self.tx.lock().take_kick();
        if tx_kick {
            self.transport.lock().notify_queue(VIRTQUEUE_TX);
        }
    }
}

impl<T: VirtioTransport> DeferredWork for NetShared<T> {
    fn run_deferred(&self) {
        if self.kick.take_request() {
            self.flush_kicks();
        }
    }
}

impl<T: VirtioTransport> Drop for NetShared<T> {
    fn drop(&mut self) {
        // キューのメモリを解放する前にデバイスを止める
        self.transport.lock().reset();
        log::debug!("[VIRTIO-NET] {}: device reset", self.name);
    }
}

// ============================================================================
// Device Facade
// ============================================================================

/// VirtIO-Net デバイス
pub struct VirtioNet<T: VirtioTransport + 'static> {
    shared: Arc<NetShared<T>>,
}

/// キューを割り当てる（アドレスの設定はまだ行わない）
fn alloc_queue<Q, T: VirtioTransport>(transport: &mut T, index: u16) -> DriverResult<Virtqueue<Q>> {
    transport.select_queue(index);
    let size = transport.get_queue_size();
    if size == 0 {
        return Err(ConfigError::QueueUnavailable(index).into());
    }
    Ok(Virtqueue::new(index, size)?)
}

/// キューのリング領域をデバイスに設定する
fn program_queues<T: VirtioTransport>(
    transport: &mut T,
    queues: &[(u16, x86_64::PhysAddr)],
) -> TransportResult<()> {
    for &(index, addr) in queues {
        transport.select_queue(index);
        transport.set_queue_address(addr)?;
    }
    Ok(())
}

/// MSI-Xベクタを割り当てる（制御キューには割り当てない）
fn setup_msix<T: VirtioTransport>(transport: &mut T) -> TransportResult<()> {
    transport.configure_queue_msix(VIRTQUEUE_RX, vector::RX)?;
    transport.configure_queue_msix(VIRTQUEUE_TX, vector::TX)?;
    transport.configure_config_msix(vector::CONFIG)
}

impl<T: VirtioTransport + 'static> VirtioNet<T> {
    /// デバイスを初期化する
    ///
    /// reset → ACKNOWLEDGE → DRIVER → フィーチャー → 設定読み取り →
    /// キュー設定 → MSI-X → 受信バッファ投入 → DRIVER_OK
    pub fn new(
        mut transport: T,
        pool: Arc<dyn BufferPool>,
        dispatcher: Arc<TickDispatcher>,
        stats: Arc<NicStats>,
        config: VirtioNetConfig,
    ) -> DriverResult<Self> {
        let name = config.name;

        // 1. ハンドシェイクとフィーチャーネゴシエーション
        let result = VirtioDeviceInit::new(&mut transport).initialize(config.features.bits());
        let negotiated = match result {
            Ok(bits) => NetFeatures::from_bits_truncate(bits),
            Err(e) => {
                VirtioDeviceInit::new(&mut transport).fail();
                log::error!("[VIRTIO-NET] {}: negotiation failed: {}", name, e);
                return Err(e.into());
            }
        };

        // 2. デバイス設定
        let device_config = match DeviceConfig::read(&transport, negotiated) {
            Ok(c) => c,
            Err(e) => {
                VirtioDeviceInit::new(&mut transport).fail();
                log::error!("[VIRTIO-NET] {}: {}", name, e);
                return Err(e.into());
            }
        };
        let layout = HeaderLayout::for_mergeable(negotiated.contains(NetFeatures::MRG_RXBUF));

        // 3. キュー
        let queues = Self::alloc_queues(
            &mut transport,
            negotiated,
            device_config.max_queue_pairs,
            pool,
            stats.clone(),
            &config,
            layout,
        );
        let (mut rx, tx, ctrl) = match queues {
            Ok(q) => q,
            Err(e) => {
                VirtioDeviceInit::new(&mut transport).fail();
                log::error!("[VIRTIO-NET] {}: queue setup failed: {}", name, e);
                return Err(e);
            }
        };

        let mut rings = alloc::vec![(rx.index(), rx.ring_addr()), (tx.index(), tx.ring_addr())];
        if let Some(ctrl) = &ctrl {
            rings.push((ctrl.index(), ctrl.ring_addr()));
        }
        if let Err(e) = program_queues(&mut transport, &rings) {
            // キューを解放する前にリングの参照を外させる
            transport.reset();
            log::error!("[VIRTIO-NET] {}: queue address rejected: {}", name, e);
            return Err(e.into());
        }

        // 4. 割り込み
        let mode = if config.use_msix && transport.supports_msix() {
            match setup_msix(&mut transport) {
                Ok(()) => IrqMode::Msix,
                Err(e) => {
                    log::warn!(
                        "[VIRTIO-NET] {}: MSI-X setup failed ({}), falling back to INTx",
                        name,
                        e
                    );
                    IrqMode::Intx
                }
            }
        } else {
            IrqMode::Intx
        };

        // 5. 受信バッファ
        let posted = rx.provision();
        if posted == 0 {
            log::warn!("[VIRTIO-NET] {}: no receive buffers posted", name);
        }

        // 6. DRIVER_OK
        if let Err(e) = VirtioDeviceInit::new(&mut transport).finish_init() {
            transport.reset();
            log::error!("[VIRTIO-NET] {}: device refused DRIVER_OK: {}", name, e);
            return Err(e.into());
        }
        if rx.take_kick() {
            transport.notify_queue(VIRTQUEUE_RX);
        }

        log::info!(
            "[VIRTIO-NET] {} initialized, MAC={} link={} features={:#x} hdr={}B irq={:?} rx_posted={}",
            name,
            device_config.mac,
            if device_config.link_up() { "up" } else { "down" },
            negotiated.bits(),
            layout.size(),
            mode,
            posted
        );

        let shared = Arc::new_cyclic(|weak: &Weak<NetShared<T>>| {
            let target: Weak<dyn DeferredWork> = weak.clone();
            NetShared {
                name,
                transport: IrqMutex::new(transport),
                rx: IrqMutex::new(rx),
                tx: IrqMutex::new(tx),
                ctrl: IrqMutex::new(ctrl),
                config: IrqMutex::new(device_config),
                rx_gate: ServiceGate::new(),
                tx_gate: ServiceGate::new(),
                kick: KickScheduler::new(dispatcher, target),
                stats,
                rx_handler: IrqMutex::new(None),
                tx_available_handler: IrqMutex::new(None),
                link_handler: IrqMutex::new(None),
                events: IrqEventChannel::new(),
                mode,
                features: negotiated,
                layout,
            }
        });

        Ok(Self { shared })
    }

    #[allow(clippy::type_complexity)]
    fn alloc_queues(
        transport: &mut T,
        features: NetFeatures,
        max_queue_pairs: u16,
        pool: Arc<dyn BufferPool>,
        stats: Arc<NicStats>,
        config: &VirtioNetConfig,
        layout: HeaderLayout,
    ) -> DriverResult<(RxQueue, TxQueue, Option<CtrlQueue>)> {
        let rx_vq = alloc_queue(transport, VIRTQUEUE_RX)?;
        let tx_vq = alloc_queue(transport, VIRTQUEUE_TX)?;

        let ctrl = if features.contains(NetFeatures::CTRL_VQ) {
            let index = ctrl_queue_index(features, max_queue_pairs)?;
            Some(CtrlQueue::new(alloc_queue(transport, index)?))
        } else {
            None
        };

        let rx = RxQueue::new(rx_vq, pool, layout, config.rx_buffer_size, stats.clone())?;
        let tx = TxQueue::new(tx_vq, layout, config.tx_pending_limit, stats);
        Ok((rx, tx, ctrl))
    }

    // ========================================================================
    // Interrupt entry points
    // ========================================================================

    /// INTx割り込みハンドラ
    ///
    /// ISRを読んで（読み取りでクリア）処理する。共有ラインで自分の割り込みで
    /// なければ `false`。
    pub fn handle_irq(&self) -> bool {
        let isr = self.shared.transport.lock().read_isr();
        let sources = IrqSource::from_isr(isr);
        if sources.is_empty() {
            return false;
        }
        self.shared.dispatch(sources);
        true
    }

    /// MSI-X割り込みハンドラ（`vector` はデバイス内のベクタ番号）
    pub fn handle_msix(&self, vector: u16) {
        self.shared.dispatch(IrqSource::from_vector(vector));
    }

    /// INTx割り込みの前半部
    ///
    /// ISRを読んで発生源を記録するだけで、処理は
    /// [`VirtioNet::service_pending_events`] に任せる。
    pub fn irq_top_half(&self) -> bool {
        let isr = self.shared.transport.lock().read_isr();
        let sources = IrqSource::from_isr(isr);
        self.shared.events.raise(sources.bits());
        !sources.is_empty()
    }

    /// MSI-X割り込みの前半部
    pub fn msix_top_half(&self, vector: u16) {
        self.shared
            .events
            .raise(IrqSource::from_vector(vector).bits());
    }

    /// 記録された割り込みを待って処理する
    pub async fn service_pending_events(&self) {
        let bits = self.shared.events.wait().await;
        self.shared.dispatch(IrqSource::from_bits_truncate(bits));
    }

    /// 割り込みイベントチャネル
    pub fn events(&self) -> &IrqEventChannel {
        &self.shared.events
    }

    // ========================================================================
    // Control commands
    // ========================================================================

    /// 制御コマンドを送って完了を待つ
    ///
    /// デバイスが応答するまでスピンする（タイムアウトなし）。
    pub fn send_ctrl(&self, cmd: CtrlCommand) -> DriverResult<()> {
        let shared = &self.shared;
        if !shared.features.contains(cmd.required_feature()) {
            return Err(CtrlError::NotNegotiated.into());
        }

        let ack = {
            let mut guard = shared.ctrl.lock();
            let ctrl = guard.as_mut().ok_or(CtrlError::NotNegotiated)?;
            ctrl.submit(&cmd)?;
            if ctrl.take_kick() {
                shared.transport.lock().notify_queue(ctrl.index());
            }
            loop {
                if let Some(ack) = ctrl.poll_complete() {
                    break ack;
                }
                core::hint::spin_loop();
            }
        };

        if ack != VIRTIO_NET_OK {
            let (class, command) = cmd.class_and_cmd();
            log::warn!(
                "[VIRTIO-NET] {}: ctrl command {}/{} rejected (ack={})",
                shared.name,
                class,
                command,
                ack
            );
            return Err(CtrlError::Rejected { class, command }.into());
        }

        if let CtrlCommand::MacAddrSet(mac) = cmd {
            shared.config.lock().mac = mac;
            log::info!("[VIRTIO-NET] {}: MAC set to {}", shared.name, mac);
        }
        Ok(())
    }

    /// プロミスキャスモード
    pub fn set_promiscuous(&self, on: bool) -> DriverResult<()> {
        self.send_ctrl(CtrlCommand::Promisc(on))
    }

    /// 全マルチキャスト受信
    pub fn set_all_multicast(&self, on: bool) -> DriverResult<()> {
        self.send_ctrl(CtrlCommand::AllMulti(on))
    }

    /// MACアドレスを変更
    pub fn set_mac_address(&self, mac: MacAddress) -> DriverResult<()> {
        self.send_ctrl(CtrlCommand::MacAddrSet(mac))
    }

    /// 告知要求を確認済みにする
    pub fn ack_announce(&self) -> DriverResult<()> {
        self.send_ctrl(CtrlCommand::AnnounceAck)
    }

    /// 使用するキューペア数を設定
    ///
    /// ドライバが構築するのはペア0（RX 0 / TX 1）だけなので、受け付けるのは1のみ。
    /// 2以上を許すとデバイスはバッファのないRXキューへ振り分けてしまう。
    pub fn set_queue_pairs(&self, pairs: u16) -> DriverResult<()> {
        match pairs {
            0 => Err(ConfigError::InvalidQueuePairs(0).into()),
            1 => self.send_ctrl(CtrlCommand::MqPairsSet(1)),
            _ => Err(ConfigError::QueueUnavailable(VIRTQUEUE_TX + 1).into()),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// ネゴシエートされたフィーチャー
    pub fn features(&self) -> NetFeatures {
        self.shared.features
    }

    /// ヘッダレイアウト
    pub fn header_layout(&self) -> HeaderLayout {
        self.shared.layout
    }

    /// 割り込みモード
    pub fn irq_mode(&self) -> IrqMode {
        self.shared.mode
    }

    /// 最大キューペア数（MQなしなら1）
    pub fn max_queue_pairs(&self) -> u16 {
        self.shared.config.lock().max_queue_pairs
    }

    /// デバイス設定のスナップショット
    pub fn device_config(&self) -> DeviceConfig {
        *self.shared.config.lock()
    }

    /// 送信待ちFIFOの長さ
    pub fn tx_pending(&self) -> usize {
        self.shared.tx.lock().pending()
    }

    /// デバイスに渡してある受信バッファ数
    pub fn rx_posted(&self) -> u16 {
        self.shared.rx.lock().posted()
    }

    /// 遅延キックが要求済みか
    pub fn kick_requested(&self) -> bool {
        self.shared.kick.is_requested()
    }

    /// 全キューの所有権を監査する
    pub fn audit(&self) -> Result<(), QueueError> {
        self.shared.rx.lock().audit()?;
        self.shared.tx.lock().audit()?;
        if let Some(ctrl) = self.shared.ctrl.lock().as_ref() {
            ctrl.audit()?;
        }
        Ok(())
    }
}

impl<T: VirtioTransport + 'static> Nic for VirtioNet<T> {
    fn name(&self) -> &str {
        self.shared.name
    }

    fn mac(&self) -> MacAddress {
        self.shared.config.lock().mac
    }

    fn mtu(&self) -> u16 {
        VIRTIO_NET_MTU
    }

    fn link_up(&self) -> bool {
        self.shared.config.lock().link_up()
    }

    fn transmit(&self, packet: Packet) {
        let outcome = self.shared.tx.lock().transmit(packet);
        if outcome == TxOutcome::Submitted {
            self.shared.kick.request_kick();
        }
    }

    fn transmit_queue_available(&self) -> usize {
        self.shared.tx.lock().available()
    }

    fn receive_queue_waiting(&self) -> usize {
        self.shared.rx.lock().waiting()
    }

    fn set_receive_handler(&self, handler: ReceiveHandler) {
        *self.shared.rx_handler.lock() = Some(handler);
    }

    fn set_tx_available_handler(&self, handler: TxAvailableHandler) {
        *self.shared.tx_available_handler.lock() = Some(handler);
    }

    fn set_link_handler(&self, handler: LinkHandler) {
        *self.shared.link_handler.lock() = Some(handler);
    }

    fn stats(&self) -> &NicStats {
        &self.shared.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::virtio::defs::VIRTIO_MSI_NO_VECTOR;
    use crate::io::virtio::defs::status;
    use crate::io::virtio::loopback::{LoopbackDevice, LoopbackTransport};
    use crate::net::mempool::Mempool;

    fn bring_up(
        device: &LoopbackDevice,
        config: VirtioNetConfig,
    ) -> DriverResult<VirtioNet<LoopbackTransport>> {
        let pool: Arc<dyn BufferPool> = Arc::new(Mempool::new(1, 2048, 64).unwrap());
        VirtioNet::new(
            device.transport(),
            pool,
            Arc::new(TickDispatcher::new()),
            Arc::new(NicStats::new()),
            config,
        )
    }

    #[test]
    fn test_bring_up() {
        let device = LoopbackDevice::builder()
            .mac([2, 0, 0, 0, 0, 1])
            .queue_size(16)
            .build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();

        assert_ne!(device.status() & status::VIRTIO_STATUS_DRIVER_OK, 0);
        assert_eq!(net.mac(), MacAddress::new([2, 0, 0, 0, 0, 1]));
        assert!(net.link_up());
        assert_eq!(net.mtu(), 1500);
        assert_eq!(net.max_queue_pairs(), 1);
        assert_eq!(net.header_layout(), HeaderLayout::Legacy);
        assert_eq!(net.irq_mode(), IrqMode::Intx);
        assert_eq!(net.rx_posted(), 16);
        assert!(device.queue_attached(0));
        assert!(device.queue_attached(1));
        assert!(device.queue_attached(2));
        assert_eq!(device.notifications(VIRTQUEUE_RX), 1);
        net.audit().unwrap();
    }

    #[test]
    fn test_drop_resets_device() {
        let device = LoopbackDevice::builder().build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        let resets = device.reset_count();
        drop(net);
        assert_eq!(device.reset_count(), resets + 1);
        assert!(!device.queue_attached(0));
    }

    #[test]
    fn test_short_config_fails_init() {
        let device = LoopbackDevice::builder()
            .max_queue_pairs(2)
            .config_len(8)
            .build();
        let err = bring_up(&device, VirtioNetConfig::default()).err();
        assert!(matches!(
            err,
            Some(DriverError::Config(ConfigError::LengthMismatch { expected: 10, available: 8 }))
        ));
        assert_ne!(device.status() & status::VIRTIO_STATUS_FAILED, 0);
    }

    #[test]
    fn test_mq_places_ctrl_queue_after_pairs() {
        let device = LoopbackDevice::builder().max_queue_pairs(4).build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        assert_eq!(net.max_queue_pairs(), 4);
        assert!(device.queue_attached(8));
        assert!(!device.queue_attached(2));

        // ペア1以外のキューは用意していない
        assert_eq!(
            net.set_queue_pairs(2),
            Err(DriverError::Config(ConfigError::QueueUnavailable(2)))
        );
        assert_eq!(
            net.set_queue_pairs(0),
            Err(DriverError::Config(ConfigError::InvalidQueuePairs(0)))
        );
        assert!(device.ctrl_commands().is_empty());

        net.set_queue_pairs(1).unwrap();
        assert_eq!(device.ctrl_commands()[0].data, alloc::vec![1, 0]);
    }

    #[test]
    fn test_max_queue_pairs_ctrl_index_overflow_fails_init() {
        let device = LoopbackDevice::builder().max_queue_pairs(0x8000).build();
        let err = bring_up(&device, VirtioNetConfig::default()).err();
        assert_eq!(
            err,
            Some(DriverError::Config(ConfigError::CtrlQueueOutOfRange(0x8000)))
        );
        assert_ne!(device.status() & status::VIRTIO_STATUS_FAILED, 0);
        assert!(!device.queue_attached(0));
    }

    #[test]
    fn test_zero_queue_pairs_fails_init() {
        let device = LoopbackDevice::builder()
            .features(NetFeatures::MAC | NetFeatures::MQ)
            .max_queue_pairs(0)
            .build();
        let err = bring_up(&device, VirtioNetConfig::default()).err();
        assert_eq!(
            err,
            Some(DriverError::Config(ConfigError::InvalidQueuePairs(0)))
        );
    }

    #[test]
    fn test_msix_vectors() {
        let device = LoopbackDevice::builder().msix(true).build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        assert_eq!(net.irq_mode(), IrqMode::Msix);
        assert_eq!(device.queue_vector(0), Some(vector::RX));
        assert_eq!(device.queue_vector(1), Some(vector::TX));
        assert_eq!(device.queue_vector(2), Some(VIRTIO_MSI_NO_VECTOR));
        assert_eq!(device.config_vector(), vector::CONFIG);
    }

    #[test]
    fn test_msix_failure_falls_back_to_intx() {
        let device = LoopbackDevice::builder().msix(true).msix_fails(true).build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        assert_eq!(net.irq_mode(), IrqMode::Intx);
    }

    #[test]
    fn test_ctrl_requires_feature() {
        let device = LoopbackDevice::builder()
            .features(NetFeatures::MAC | NetFeatures::STATUS)
            .build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        assert_eq!(
            net.set_promiscuous(true),
            Err(DriverError::Ctrl(CtrlError::NotNegotiated))
        );
        assert!(device.ctrl_commands().is_empty());
    }

    #[test]
    fn test_mac_addr_set_updates_cached_mac() {
        let device = LoopbackDevice::builder().build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        let mac = MacAddress::new([2, 0xAA, 0, 0, 0, 7]);
        net.set_mac_address(mac).unwrap();
        assert_eq!(net.mac(), mac);

        // 設定変更割り込みの後も保持される
        device.set_link(false);
        assert!(net.handle_irq());
        assert_eq!(net.mac(), mac);
        assert!(!net.link_up());
    }

    #[test]
    fn test_ctrl_rejected() {
        let device = LoopbackDevice::builder().ctrl_ack(ctrl::VIRTIO_NET_ERR).build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        assert_eq!(
            net.set_all_multicast(true),
            Err(DriverError::Ctrl(CtrlError::Rejected {
                class: ctrl::class::RX,
                command: ctrl::class::RX_ALLMULTI
            }))
        );
        net.audit().unwrap();
    }

    #[test]
    fn test_frames_without_handler_count_only_as_drops() {
        let device = LoopbackDevice::builder().build();
        let net = bring_up(&device, VirtioNetConfig::default()).unwrap();
        assert!(device.deliver_rx(&[0x11; 60]));
        assert!(net.handle_irq());

        let snap = net.stats().snapshot();
        assert_eq!(snap.rx_packets, 0);
        assert_eq!(snap.rx_bytes, 0);
        assert_eq!(snap.rx_dropped, 1);

        net.set_receive_handler(Box::new(|_packet| {}));
        assert!(device.deliver_rx(&[0x22; 60]));
        net.handle_irq();
        let snap = net.stats().snapshot();
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, 60);
        assert_eq!(snap.rx_dropped, 1);
    }
}
