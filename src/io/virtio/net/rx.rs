// ============================================================================
// src/io/virtio/net/rx.rs - Receive Queue Manager
// ============================================================================
//!
//! 受信キュー管理
//!
//! 空きディスクリプタには常にプールのバッファを1枚ずつ（ヘッダ込みの
//! デバイス書き込み可能区間として）ポストしておく。Usedリングに返ってきた
//! バッファはヘッダを外してパケットとして上位に渡し、その後で補充する。
//!
//! マージ受信（MRG_RXBUF）では1フレームが複数バッファにまたがる。
//! 後続バッファの内容は先頭バッファの末尾に連結する。

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::header::{HeaderLayout, VirtioNetHdr};
use crate::error::{ConfigError, QueueError};
use crate::io::virtio::virtqueue::{Segment, Virtqueue};
use crate::net::mempool::{BufferPool, RawBuffer};
use crate::net::nic::NicStats;
use crate::net::packet::Packet;

/// 組み立て中のフレーム
struct Assembly {
    /// 先頭バッファ（ヘッダ込み）
    first: RawBuffer,
    /// 先頭バッファに書かれたバイト数
    filled: usize,
    /// 残りのバッファ数
    remaining: u16,
    hdr: VirtioNetHdr,
    /// 連結しきれなかった
    overflow: bool,
}

/// 1チェーン回収の結果
#[derive(Debug)]
pub enum Harvest {
    /// 完成したフレーム
    Packet(Packet),
    /// 不正なフレームを捨てた
    Dropped,
    /// マージ受信の途中
    Partial,
}

/// 受信キュー
pub struct RxQueue {
    vq: Virtqueue<RawBuffer>,
    pool: Arc<dyn BufferPool>,
    layout: HeaderLayout,
    /// ポストするバッファ長（ヘッダ込み）
    buffer_len: usize,
    assembling: Option<Assembly>,
    stats: Arc<NicStats>,
    /// プール枯渇でポストできなかった回数
    alloc_failures: u64,
}

impl RxQueue {
    pub fn new(
        vq: Virtqueue<RawBuffer>,
        pool: Arc<dyn BufferPool>,
        layout: HeaderLayout,
        buffer_len: usize,
        stats: Arc<NicStats>,
    ) -> Result<Self, ConfigError> {
        let buffer_len = buffer_len.min(pool.buffer_capacity());
        if buffer_len <= layout.size() {
            return Err(ConfigError::BufferTooSmall(buffer_len));
        }
        Ok(Self {
            vq,
            pool,
            layout,
            buffer_len,
            assembling: None,
            stats,
            alloc_failures: 0,
        })
    }

    /// キューインデックス
    pub fn index(&self) -> u16 {
        self.vq.index()
    }

    /// リング領域の物理アドレス
    pub fn ring_addr(&self) -> x86_64::PhysAddr {
        self.vq.phys_addr()
    }

    /// ポストするバッファ長
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// デバイスに渡してあるバッファ数
    pub fn posted(&self) -> u16 {
        self.vq.in_flight()
    }

    /// 空きディスクリプタ数
    pub fn num_free(&self) -> u16 {
        self.vq.num_free()
    }

    /// プール枯渇の回数
    pub fn alloc_failures(&self) -> u64 {
        self.alloc_failures
    }

    /// 受信済みで未回収のバッファ数の半分
    ///
    /// 1フレームあたりヘッダとペイロードの2区間を想定した見積もりで、
    /// 送信側の空き計算と揃えている。
    pub fn waiting(&mut self) -> usize {
        self.vq.observe_used() as usize / 2
    }

    /// 空きディスクリプタがなくなるまでバッファをポストする
    ///
    /// 戻り値はポストした数。
    pub fn provision(&mut self) -> usize {
        let mut posted = 0;
        while self.vq.num_free() > 0 {
            let buffer = match self.pool.alloc(self.buffer_len) {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.alloc_failures += 1;
                    log::warn!(
                        "[VIRTIO-NET] rx: cannot provision buffer ({}), {} posted",
                        e,
                        self.vq.in_flight()
                    );
                    break;
                }
            };

            let segment = Segment::writable(buffer.phys_addr(), self.buffer_len as u32);
            if let Err((e, buffer)) = self.vq.add(&[segment], buffer) {
                log::error!("[VIRTIO-NET] rx: add failed: {}", e);
                self.pool.release(buffer);
                break;
            }
            posted += 1;
        }
        posted
    }

    /// Usedリングから1チェーン回収する
    pub fn harvest_one(&mut self) -> Option<Harvest> {
        let (buffer, used_len) = self.vq.pop_used()?;
        let used_len = used_len as usize;

        if let Some(asm) = self.assembling.take() {
            return Some(self.continue_frame(asm, buffer, used_len));
        }

        // 長さが不正でもヘッダは読んで、後続バッファの数を知る
        let hsize = self.layout.size();
        let written = used_len.min(self.buffer_len);
        let hdr = match VirtioNetHdr::decode(self.layout, &buffer.as_slice()[..written]) {
            Ok(hdr) => hdr,
            Err(e) => {
                log::debug!("[VIRTIO-NET] rx: {}", e);
                return Some(self.drop_frame(buffer));
            }
        };

        let malformed = used_len <= hsize || used_len > self.buffer_len;
        if malformed {
            log::debug!(
                "[VIRTIO-NET] rx: malformed used length {} (header {}, buffer {})",
                used_len,
                hsize,
                self.buffer_len
            );
        }

        match hdr.frame_buffers(self.layout) {
            0 => {
                log::debug!("[VIRTIO-NET] rx: num_buffers is zero");
                Some(self.drop_frame(buffer))
            }
            1 if malformed => Some(self.drop_frame(buffer)),
            1 => Some(Harvest::Packet(self.complete(buffer, used_len, hdr))),
            n => {
                // 不正な先頭でも後続バッファはこのフレームのものとして読み捨てる
                self.assembling = Some(Assembly {
                    first: buffer,
                    filled: if malformed { 0 } else { used_len },
                    remaining: n - 1,
                    hdr,
                    overflow: malformed,
                });
                Some(Harvest::Partial)
            }
        }
    }

    /// マージ受信の後続バッファを処理
    fn continue_frame(&mut self, mut asm: Assembly, buffer: RawBuffer, used_len: usize) -> Harvest {
        if !asm.overflow {
            let room = asm.first.capacity() - asm.filled;
            if used_len > self.buffer_len || used_len > room {
                asm.overflow = true;
            } else {
                let start = asm.filled;
                asm.first.as_mut_slice()[start..start + used_len]
                    .copy_from_slice(&buffer.as_slice()[..used_len]);
                asm.filled += used_len;
            }
        }
        self.pool.release(buffer);

        asm.remaining -= 1;
        if asm.remaining > 0 {
            self.assembling = Some(asm);
            return Harvest::Partial;
        }

        if asm.overflow {
            log::debug!("[VIRTIO-NET] rx: merged frame malformed or too long, dropped");
            return self.drop_frame(asm.first);
        }
        Harvest::Packet(self.complete(asm.first, asm.filled, asm.hdr))
    }

    fn complete(&mut self, buffer: RawBuffer, total: usize, hdr: VirtioNetHdr) -> Packet {
        let hsize = self.layout.size();
        let payload = total - hsize;
        Packet::from_buffer(buffer, self.pool.clone(), hsize, payload, hdr)
    }

    fn drop_frame(&mut self, buffer: RawBuffer) -> Harvest {
        self.pool.release(buffer);
        self.stats.count_rx_drop();
        Harvest::Dropped
    }

    /// デバイスの割り込みを抑制して、返ってきたフレームをすべて回収する
    ///
    /// 受信統計は数えない。上位に渡した時点で呼び出し側が数える。
    pub fn drain(&mut self) -> Vec<Packet> {
        self.vq.disable_interrupts();
        let mut packets = Vec::new();
        while let Some(harvest) = self.harvest_one() {
            if let Harvest::Packet(packet) = harvest {
                packets.push(packet);
            }
        }
        packets
    }

    /// 補充して割り込みを再開する
    ///
    /// 再開までの間にデバイスが返したものがあれば `true`。
    pub fn refill(&mut self) -> bool {
        self.provision();
        self.vq.enable_interrupts();
        self.vq.new_incoming() > 0
    }

    /// 回収・配送・補充を1回行う
    ///
    /// 配送はロックを保持したまま行われるので、ハンドラから
    /// このキューに触れる場合は [`RxQueue::drain`] と [`RxQueue::refill`] を分けて使う。
    pub fn service<F: FnMut(Packet)>(&mut self, mut deliver: F) -> usize {
        let packets = self.drain();
        let count = packets.len();
        for packet in packets {
            self.stats.count_rx(packet.len());
            deliver(packet);
        }
        self.refill();
        count
    }

    /// 通知が必要か（未通知カウンタはリセットされる）
    pub fn take_kick(&mut self) -> bool {
        self.vq.take_kick()
    }

    /// 未通知のポストがあるか
    pub fn has_unkicked(&self) -> bool {
        self.vq.unkicked() > 0
    }

    /// 所有権の監査
    pub fn audit(&self) -> Result<(), QueueError> {
        self.vq.audit()
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        // デバイスはリセット済みであること
        for buffer in self.vq.drain_tokens() {
            self.pool.release(buffer);
        }
        if let Some(asm) = self.assembling.take() {
            self.pool.release(asm.first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::virtio::loopback::{LoopbackDevice, attach_queue};
    use crate::io::virtio::net::NetFeatures;
    use crate::net::mempool::Mempool;

    struct Fixture {
        device: LoopbackDevice,
        mempool: Arc<Mempool>,
        rx: RxQueue,
        stats: Arc<NicStats>,
    }

    fn fixture(queue_size: u16, buffers: usize, mergeable: bool) -> Fixture {
        let device = LoopbackDevice::builder().queue_size(queue_size).build();
        let mut transport = device.transport();
        if mergeable {
            use crate::io::virtio::transport::VirtioTransport;
            transport.set_driver_features(NetFeatures::MRG_RXBUF.bits());
        }
        let vq = attach_queue(&mut transport, 0);
        let mempool = Arc::new(Mempool::new(1, 256, buffers).unwrap());
        let pool: Arc<dyn BufferPool> = mempool.clone();
        let stats = Arc::new(NicStats::new());
        let rx = RxQueue::new(
            vq,
            pool,
            HeaderLayout::for_mergeable(mergeable),
            256,
            stats.clone(),
        )
        .unwrap();
        Fixture {
            device,
            mempool,
            rx,
            stats,
        }
    }

    #[test]
    fn test_buffer_too_small() {
        let device = LoopbackDevice::builder().build();
        let mut transport = device.transport();
        let vq = attach_queue(&mut transport, 0);
        let pool: Arc<dyn BufferPool> = Arc::new(Mempool::new(1, 256, 4).unwrap());
        let err = RxQueue::new(vq, pool, HeaderLayout::Mergeable, 12, Arc::new(NicStats::new()));
        assert!(matches!(err, Err(ConfigError::BufferTooSmall(12))));
    }

    #[test]
    fn test_provision_fills_queue() {
        let mut f = fixture(8, 16, false);
        assert_eq!(f.rx.provision(), 8);
        assert_eq!(f.rx.posted(), 8);
        assert_eq!(f.mempool.available(), 8);
        assert_eq!(f.rx.provision(), 0);
        f.rx.audit().unwrap();
    }

    #[test]
    fn test_provision_stops_when_pool_empty() {
        let mut f = fixture(8, 3, false);
        assert_eq!(f.rx.provision(), 3);
        assert_eq!(f.rx.alloc_failures(), 1);
        assert_eq!(f.rx.num_free(), 5);
        f.rx.audit().unwrap();
    }

    #[test]
    fn test_service_delivers_and_refills() {
        let mut f = fixture(4, 8, false);
        f.rx.provision();

        assert!(f.device.deliver_rx(&[0xAA; 60]));
        assert!(f.device.deliver_rx(&[0xBB; 100]));

        let mut lens = Vec::new();
        assert_eq!(f.rx.service(|p| lens.push((p.len(), p.data()[0]))), 2);
        assert_eq!(lens, alloc::vec![(60, 0xAA), (100, 0xBB)]);
        assert_eq!(f.rx.posted(), 4);
        assert_eq!(f.stats.snapshot().rx_packets, 2);
        assert_eq!(f.stats.snapshot().rx_bytes, 160);
        f.rx.audit().unwrap();
    }

    #[test]
    fn test_malformed_lengths_are_dropped() {
        let mut f = fixture(4, 8, false);
        f.rx.provision();

        // ヘッダ以下
        assert!(f.device.deliver_rx_raw(&[0; 10], 10));
        // バッファ長超過
        assert!(f.device.deliver_rx_raw(&[0; 10], 4096));
        assert!(f.device.deliver_rx(&[1; 20]));

        let packets = f.rx.drain();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 20);
        assert_eq!(f.stats.snapshot().rx_dropped, 2);
        drop(packets);

        f.rx.refill();
        assert_eq!(f.rx.posted(), 4);
        assert_eq!(f.mempool.available(), 4);
    }

    #[test]
    fn test_mergeable_reassembly() {
        let mut f = fixture(8, 16, true);
        f.rx.provision();

        let frame: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        assert!(f.device.deliver_rx_merged(&frame, 3));

        let packets = f.rx.drain();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data(), &frame[..]);
        assert_eq!(packets[0].offload().num_buffers, 3);
    }

    #[test]
    fn test_mergeable_overflow_drops_frame() {
        let mut f = fixture(8, 16, true);
        f.rx.provision();

        // 3バッファ分は先頭バッファに収まらない
        let frame = [7u8; 600];
        assert!(f.device.deliver_rx_merged(&frame, 3));
        assert!(f.device.deliver_rx(&[1; 30]));

        let packets = f.rx.drain();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 30);
        assert_eq!(f.stats.snapshot().rx_dropped, 1);
    }

    #[test]
    fn test_malformed_merged_head_swallows_continuations() {
        let mut f = fixture(8, 16, true);
        f.rx.provision();

        // 先頭の使用長がバッファ長を超え、num_buffers=3
        let mut head = [0u8; 64];
        head[10..12].copy_from_slice(&3u16.to_le_bytes());
        assert!(f.device.deliver_rx_raw(&head, 4096));
        assert!(f.device.deliver_rx_raw(&[0x45; 200], 200));
        assert!(f.device.deliver_rx_raw(&[0x45; 200], 200));
        assert!(f.device.deliver_rx(&[9; 50]));

        let packets = f.rx.drain();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data(), &[9u8; 50][..]);
        assert_eq!(f.stats.snapshot().rx_dropped, 1);
        drop(packets);

        f.rx.refill();
        assert_eq!(f.mempool.available(), 8);
        f.rx.audit().unwrap();
    }

    #[test]
    fn test_drain_does_not_count_rx() {
        let mut f = fixture(4, 8, false);
        f.rx.provision();
        assert!(f.device.deliver_rx(&[3; 60]));
        assert_eq!(f.rx.drain().len(), 1);
        assert_eq!(f.stats.snapshot().rx_packets, 0);
    }

    #[test]
    fn test_zero_num_buffers_dropped() {
        let mut f = fixture(4, 8, true);
        f.rx.provision();

        let mut raw = [0u8; 40];
        raw[10..12].copy_from_slice(&0u16.to_le_bytes());
        assert!(f.device.deliver_rx_raw(&raw, 40));
        assert!(f.rx.drain().is_empty());
        assert_eq!(f.stats.snapshot().rx_dropped, 1);
    }
}
