// ============================================================================
// src/io/virtio/net/ctrl.rs - Control Queue Manager
// ============================================================================
//!
//! 制御キュー（CTRL_VQ）
//!
//! コマンドは [クラス/コマンド (R), ペイロード (R), ack (W)] のチェーン。
//! 同時に処理中にできるコマンドは1つだけで、呼び出し側は完了まで待つ。

use alloc::boxed::Box;
use x86_64::PhysAddr;

use super::NetFeatures;
use crate::error::QueueError;
use crate::io::virtio::virtqueue::{Segment, Virtqueue};
use crate::net::ethernet::MacAddress;

/// コマンドクラスとコマンド
pub mod class {
    pub const RX: u8 = 0;
    pub const RX_PROMISC: u8 = 0;
    pub const RX_ALLMULTI: u8 = 1;

    pub const MAC: u8 = 1;
    pub const MAC_ADDR_SET: u8 = 1;

    pub const VLAN: u8 = 2;

    pub const ANNOUNCE: u8 = 3;
    pub const ANNOUNCE_ACK: u8 = 0;

    pub const MQ: u8 = 4;
    pub const MQ_VQ_PAIRS_SET: u8 = 0;
}

/// ack値
pub const VIRTIO_NET_OK: u8 = 0;
pub const VIRTIO_NET_ERR: u8 = 1;

/// デバイスがまだ書いていないことを示す値
const ACK_PENDING: u8 = 0xFF;

/// ペイロードの最大長（MACアドレス）
const MAX_PAYLOAD: usize = 8;

/// 制御コマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCommand {
    /// プロミスキャスモード
    Promisc(bool),
    /// 全マルチキャスト受信
    AllMulti(bool),
    /// MACアドレス設定
    MacAddrSet(MacAddress),
    /// 告知要求の確認
    AnnounceAck,
    /// 使用するキューペア数
    MqPairsSet(u16),
}

impl CtrlCommand {
    /// (クラス, コマンド)
    pub fn class_and_cmd(&self) -> (u8, u8) {
        match self {
            Self::Promisc(_) => (class::RX, class::RX_PROMISC),
            Self::AllMulti(_) => (class::RX, class::RX_ALLMULTI),
            Self::MacAddrSet(_) => (class::MAC, class::MAC_ADDR_SET),
            Self::AnnounceAck => (class::ANNOUNCE, class::ANNOUNCE_ACK),
            Self::MqPairsSet(_) => (class::MQ, class::MQ_VQ_PAIRS_SET),
        }
    }

    /// 必要なフィーチャー
    pub fn required_feature(&self) -> NetFeatures {
        match self {
            Self::Promisc(_) | Self::AllMulti(_) => NetFeatures::CTRL_RX,
            Self::MacAddrSet(_) => NetFeatures::CTRL_MAC_ADDR,
            Self::AnnounceAck => NetFeatures::GUEST_ANNOUNCE,
            Self::MqPairsSet(_) => NetFeatures::MQ,
        }
    }

    /// ペイロードを書き、その長さを返す
    pub fn encode_payload(&self, out: &mut [u8; MAX_PAYLOAD]) -> usize {
        match self {
            Self::Promisc(on) | Self::AllMulti(on) => {
                out[0] = *on as u8;
                1
            }
            Self::MacAddrSet(mac) => {
                out[..6].copy_from_slice(mac.as_bytes());
                6
            }
            Self::AnnounceAck => 0,
            Self::MqPairsSet(pairs) => {
                out[..2].copy_from_slice(&pairs.to_le_bytes());
                2
            }
        }
    }
}

/// デバイスと共有するコマンド領域
#[repr(C)]
struct CtrlBuffer {
    hdr: [u8; 2],
    data: [u8; MAX_PAYLOAD],
    ack: u8,
}

/// 制御キュー
pub struct CtrlQueue {
    vq: Virtqueue<()>,
    buf: Box<CtrlBuffer>,
    /// 処理中のコマンド
    in_flight: Option<(u8, u8)>,
}

impl CtrlQueue {
    pub fn new(vq: Virtqueue<()>) -> Self {
        Self {
            vq,
            buf: Box::new(CtrlBuffer {
                hdr: [0; 2],
                data: [0; MAX_PAYLOAD],
                ack: ACK_PENDING,
            }),
            in_flight: None,
        }
    }

    /// キューインデックス
    pub fn index(&self) -> u16 {
        self.vq.index()
    }

    /// リング領域の物理アドレス
    pub fn ring_addr(&self) -> PhysAddr {
        self.vq.phys_addr()
    }

    /// 処理中のコマンド
    pub fn in_flight(&self) -> Option<(u8, u8)> {
        self.in_flight
    }

    /// コマンドを公開する（通知は呼び出し側）
    pub fn submit(&mut self, cmd: &CtrlCommand) -> Result<(), QueueError> {
        if self.in_flight.is_some() {
            return Err(QueueError::Full);
        }

        let (class, command) = cmd.class_and_cmd();
        self.buf.hdr = [class, command];
        let len = cmd.encode_payload(&mut self.buf.data);
        // SAFETY: bufはBoxで固定されている
        unsafe { core::ptr::write_volatile(&mut self.buf.ack, ACK_PENDING) };

        let hdr = Segment::readable(PhysAddr::new(self.buf.hdr.as_ptr() as u64), 2);
        let data = Segment::readable(PhysAddr::new(self.buf.data.as_ptr() as u64), len as u32);
        let ack = Segment::writable(PhysAddr::new(&self.buf.ack as *const u8 as u64), 1);

        let result = if len > 0 {
            self.vq.add(&[hdr, data, ack], ())
        } else {
            self.vq.add(&[hdr, ack], ())
        };
        result.map_err(|(e, ())| e)?;

        self.in_flight = Some((class, command));
        Ok(())
    }

    /// 完了していればack値を返す
    pub fn poll_complete(&mut self) -> Option<u8> {
        self.in_flight?;
        self.vq.pop_used()?;
        self.in_flight = None;
        // SAFETY: デバイスは書き終えている
        Some(unsafe { core::ptr::read_volatile(&self.buf.ack) })
    }

    /// 通知が必要か
    pub fn take_kick(&mut self) -> bool {
        self.vq.take_kick()
    }

    /// 所有権の監査
    pub fn audit(&self) -> Result<(), QueueError> {
        self.vq.audit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::virtio::loopback::{LoopbackDevice, attach_queue};
    use crate::io::virtio::transport::VirtioTransport;

    #[test]
    fn test_command_encoding() {
        let mut out = [0u8; MAX_PAYLOAD];
        assert_eq!(CtrlCommand::Promisc(true).encode_payload(&mut out), 1);
        assert_eq!(out[0], 1);
        assert_eq!(CtrlCommand::MqPairsSet(0x0102).encode_payload(&mut out), 2);
        assert_eq!(&out[..2], &[0x02, 0x01]);
        assert_eq!(CtrlCommand::AnnounceAck.encode_payload(&mut out), 0);

        assert_eq!(CtrlCommand::AllMulti(false).class_and_cmd(), (0, 1));
        assert_eq!(
            CtrlCommand::MacAddrSet(MacAddress::ZERO).class_and_cmd(),
            (class::MAC, class::MAC_ADDR_SET)
        );
        assert_eq!(CtrlCommand::AnnounceAck.required_feature(), NetFeatures::GUEST_ANNOUNCE);
    }

    #[test]
    fn test_submit_and_complete() {
        let device = LoopbackDevice::builder().build();
        let mut transport = device.transport();
        let mut ctrl = CtrlQueue::new(attach_queue(&mut transport, 2));

        let mac = MacAddress::new([2, 0, 0, 0, 0, 9]);
        ctrl.submit(&CtrlCommand::MacAddrSet(mac)).unwrap();
        assert_eq!(ctrl.in_flight(), Some((class::MAC, class::MAC_ADDR_SET)));
        assert_eq!(ctrl.submit(&CtrlCommand::Promisc(true)), Err(QueueError::Full));
        assert_eq!(ctrl.poll_complete(), None);

        assert!(ctrl.take_kick());
        transport.notify_queue(ctrl.index());
        assert_eq!(ctrl.poll_complete(), Some(VIRTIO_NET_OK));
        assert_eq!(ctrl.in_flight(), None);

        let log = device.ctrl_commands();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].class, class::MAC);
        assert_eq!(log[0].data, alloc::vec![2, 0, 0, 0, 0, 9]);
        ctrl.audit().unwrap();
    }

    #[test]
    fn test_rejected_ack() {
        let device = LoopbackDevice::builder().ctrl_ack(VIRTIO_NET_ERR).build();
        let mut transport = device.transport();
        let mut ctrl = CtrlQueue::new(attach_queue(&mut transport, 2));

        ctrl.submit(&CtrlCommand::AnnounceAck).unwrap();
        transport.notify_queue(ctrl.index());
        assert_eq!(ctrl.poll_complete(), Some(VIRTIO_NET_ERR));
        assert!(device.ctrl_commands()[0].data.is_empty());
    }
}
