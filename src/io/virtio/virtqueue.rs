// ============================================================================
// src/io/virtio/virtqueue.rs - Legacy Split Virtqueue
// ============================================================================
//!
//! レガシーレイアウトのVirtqueue実装
//!
//! リング領域はページ境界に揃えた1つの連続領域で、デバイスと共有される。
//! 共有領域へのアクセスはすべてvolatileで行い、公開順序はフェンスで保証する。
//!
//! ## 所有権
//! 各ディスクリプタは常に「空き」「公開済み（Available）」「返却済み・未回収
//! （Used）」のいずれか1つにある。チェーン先頭をAvailableリングに公開した時点で
//! バッファの所有権はデバイスへ移り、Usedリングに現れたときにだけ戻る。
//! チェーンに紐づくトークン（バッファ本体）は先頭インデックスで引く
//! アリーナに保持し、[`Virtqueue::audit`] で不変条件を検査できる。

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};
use x86_64::PhysAddr;

use super::defs::*;
use crate::error::QueueError;

/// チェーンを構成する1区間
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// 物理アドレス
    pub addr: PhysAddr,
    /// 長さ
    pub len: u32,
    /// デバイスが書き込む区間か
    pub writable: bool,
}

impl Segment {
    /// デバイスが読む区間
    pub const fn readable(addr: PhysAddr, len: u32) -> Self {
        Self {
            addr,
            len,
            writable: false,
        }
    }

    /// デバイスが書く区間
    pub const fn writable(addr: PhysAddr, len: u32) -> Self {
        Self {
            addr,
            len,
            writable: true,
        }
    }
}

/// ディスクリプタの状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescOwner {
    /// ドライバ（空きリスト上）
    Driver,
    /// デバイス（Availableリングに公開済み）
    Available,
    /// デバイスがUsedリングに返したが、まだ回収していない
    Used,
}

/// 使用中チェーンの記録
struct InFlight<T> {
    token: T,
    chain_len: u16,
    /// 公開したAvailableリング上の位置（idx）
    avail_pos: u16,
}

/// レガシーVirtqueue
pub struct Virtqueue<T> {
    /// キューインデックス
    index: u16,
    /// リングのレイアウト
    layout: VringLayout,
    /// 共有領域の先頭
    base: NonNull<u8>,
    /// 空きリストの先頭
    free_head: u16,
    /// 空きディスクリプタ数
    num_free: u16,
    /// 最後に回収したUsedインデックス
    last_used_idx: u16,
    /// Availableインデックスのシャドウ
    avail_idx: u16,
    /// 未通知の公開数
    unkicked: u16,
    /// チェーン先頭 → トークン
    in_flight: Vec<Option<InFlight<T>>>,
    /// ディスクリプタごとの所有者
    owners: Vec<DescOwner>,
}

// SAFETY: 共有領域はこの構造体が排他的に所有し、トークンはSendである
unsafe impl<T: Send> Send for Virtqueue<T> {}

impl<T> Virtqueue<T> {
    /// 新しいVirtqueueを割り当てる
    ///
    /// `size` はデバイスが報告したキューサイズ（2のべき乗）。
    pub fn new(index: u16, size: u16) -> Result<Self, QueueError> {
        if size == 0 || !size.is_power_of_two() || size > VIRTQUEUE_MAX_SIZE {
            return Err(QueueError::InvalidSize(size));
        }

        let layout = VringLayout::new(size);
        let mem_layout = Layout::from_size_align(layout.total_size, VIRTIO_LEGACY_ALIGN)
            .map_err(|_| QueueError::AllocationFailed)?;
        // SAFETY: サイズは非ゼロ
        let base = NonNull::new(unsafe { alloc_zeroed(mem_layout) })
            .ok_or(QueueError::AllocationFailed)?;

        let mut queue = Self {
            index,
            layout,
            base,
            free_head: 0,
            num_free: size,
            last_used_idx: 0,
            avail_idx: 0,
            unkicked: 0,
            in_flight: (0..size).map(|_| None).collect(),
            owners: alloc::vec![DescOwner::Driver; size as usize],
        };

        // ディスクリプタテーブルを空きリストとして連結
        for i in 0..size {
            queue.write_desc(
                i,
                VringDesc {
                    addr: 0,
                    len: 0,
                    flags: 0,
                    next: if i + 1 < size { i + 1 } else { 0 },
                },
            );
        }

        Ok(queue)
    }

    // ========================================================================
    // Shared memory access
    // ========================================================================

    fn desc_ptr(&self, idx: u16) -> *mut VringDesc {
        // SAFETY: idx < size で、テーブルは領域先頭にある
        unsafe { self.base.as_ptr().add(16 * idx as usize) as *mut VringDesc }
    }

    fn read_desc(&self, idx: u16) -> VringDesc {
        // SAFETY: 領域はself.baseが所有し、アライメントは16
        unsafe { core::ptr::read_volatile(self.desc_ptr(idx)) }
    }

    fn write_desc(&mut self, idx: u16, desc: VringDesc) {
        // SAFETY: 同上
        unsafe { core::ptr::write_volatile(self.desc_ptr(idx), desc) }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        // SAFETY: オフセットはレイアウト内で2バイト境界
        unsafe { core::ptr::read_volatile(self.base.as_ptr().add(offset) as *const u16) }
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        // SAFETY: 同上
        unsafe { core::ptr::write_volatile(self.base.as_ptr().add(offset) as *mut u16, value) }
    }

    fn read_used_elem(&self, slot: u16) -> VringUsedElem {
        // SAFETY: used.ring[slot] は4バイト境界
        unsafe {
            core::ptr::read_volatile(
                self.base.as_ptr().add(self.layout.used_ring(slot)) as *const VringUsedElem
            )
        }
    }

    // ========================================================================
    // Queue information
    // ========================================================================

    /// キューインデックス
    pub fn index(&self) -> u16 {
        self.index
    }

    /// キューサイズ
    pub fn size(&self) -> u16 {
        self.layout.size
    }

    /// リング領域の物理アドレス
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.base.as_ptr() as u64)
    }

    /// リングのレイアウト
    pub fn layout(&self) -> VringLayout {
        self.layout
    }

    /// 空きディスクリプタ数
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// デバイス所有のディスクリプタ数
    pub fn in_flight(&self) -> u16 {
        self.layout.size - self.num_free
    }

    /// デバイスが返したがまだ回収していないチェーン数
    pub fn new_incoming(&self) -> u16 {
        let used_idx = self.read_u16(self.layout.used_idx());
        used_idx.wrapping_sub(self.last_used_idx)
    }

    /// Usedリングに現れた未回収チェーンをUsed状態にする（回収はしない）
    ///
    /// 戻り値は未回収のチェーン数。
    pub fn observe_used(&mut self) -> u16 {
        let incoming = self.new_incoming();
        fence(Ordering::Acquire);
        for k in 0..incoming.min(self.layout.size) {
            let slot = self.last_used_idx.wrapping_add(k) % self.layout.size;
            let id = self.read_used_elem(slot).id;
            if let Some(chain_len) = self.chain_len_of(id) {
                self.set_chain_owner(id as u16, chain_len, DescOwner::Used);
            }
        }
        incoming
    }

    /// 使用中チェーンの長さ
    fn chain_len_of(&self, id: u32) -> Option<u16> {
        self.in_flight
            .get(id as usize)
            .and_then(Option::as_ref)
            .map(|entry| entry.chain_len)
    }

    fn set_chain_owner(&mut self, head: u16, chain_len: u16, owner: DescOwner) {
        let mut idx = head;
        for i in 0..chain_len {
            self.owners[idx as usize] = owner;
            if i + 1 < chain_len {
                idx = self.read_desc(idx).next;
            }
        }
    }

    /// 次の `add` で先頭になるディスクリプタ
    pub fn next_head(&self) -> Option<u16> {
        (self.num_free > 0).then_some(self.free_head)
    }

    /// ディスクリプタの所有者
    pub fn owner(&self, idx: u16) -> Option<DescOwner> {
        self.owners.get(idx as usize).copied()
    }

    // ========================================================================
    // Driver → Device
    // ========================================================================

    /// チェーンを構築してAvailableリングに公開する
    ///
    /// 失敗時はトークンを返す。
    pub fn add(&mut self, segments: &[Segment], token: T) -> Result<u16, (QueueError, T)> {
        if segments.is_empty() {
            return Err((QueueError::EmptyChain, token));
        }
        if segments.len() > self.num_free as usize {
            return Err((QueueError::Full, token));
        }

        let head = self.free_head;
        let mut idx = head;
        for (i, seg) in segments.iter().enumerate() {
            let next_free = self.read_desc(idx).next;
            let last = i + 1 == segments.len();

            let mut flags = 0;
            if seg.writable {
                flags |= vring_flags::VRING_DESC_F_WRITE;
            }
            if !last {
                flags |= vring_flags::VRING_DESC_F_NEXT;
            }
            self.write_desc(
                idx,
                VringDesc {
                    addr: seg.addr.as_u64(),
                    len: seg.len,
                    flags,
                    next: if last { 0 } else { next_free },
                },
            );
            self.owners[idx as usize] = DescOwner::Available;

            if last {
                self.free_head = next_free;
            }
            idx = next_free;
        }

        let chain_len = segments.len() as u16;
        self.num_free -= chain_len;
        self.in_flight[head as usize] = Some(InFlight {
            token,
            chain_len,
            avail_pos: self.avail_idx,
        });

        // ディスクリプタの書き込みをリングエントリより先に見せる
        fence(Ordering::Release);
        let slot = self.avail_idx % self.layout.size;
        self.write_u16(self.layout.avail_ring(slot), head);

        // リングエントリの書き込み後にidxを更新
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.write_u16(self.layout.avail_idx(), self.avail_idx);
        self.unkicked = self.unkicked.saturating_add(1);

        Ok(head)
    }

    /// 未通知の公開があり、デバイスが通知を望んでいれば `true`
    ///
    /// 未通知カウンタはここでリセットされる。
    pub fn take_kick(&mut self) -> bool {
        if self.unkicked == 0 {
            return false;
        }
        self.unkicked = 0;

        // idxの公開とused.flagsの読み取りを順序付ける
        fence(Ordering::SeqCst);
        self.read_u16(self.layout.used_flags()) & used_flags::VRING_USED_F_NO_NOTIFY == 0
    }

    /// 未通知の公開数
    pub fn unkicked(&self) -> u16 {
        self.unkicked
    }

    /// デバイスに割り込みを抑制させる
    pub fn disable_interrupts(&mut self) {
        let flags = self.read_u16(self.layout.avail_flags());
        self.write_u16(
            self.layout.avail_flags(),
            flags | avail_flags::VRING_AVAIL_F_NO_INTERRUPT,
        );
    }

    /// 割り込み抑制を解除
    pub fn enable_interrupts(&mut self) {
        let flags = self.read_u16(self.layout.avail_flags());
        self.write_u16(
            self.layout.avail_flags(),
            flags & !avail_flags::VRING_AVAIL_F_NO_INTERRUPT,
        );
        fence(Ordering::SeqCst);
    }

    /// 割り込みが抑制されているか
    pub fn interrupts_disabled(&self) -> bool {
        self.read_u16(self.layout.avail_flags()) & avail_flags::VRING_AVAIL_F_NO_INTERRUPT != 0
    }

    // ========================================================================
    // Device → Driver
    // ========================================================================

    /// Usedリングから1チェーン回収する
    ///
    /// 戻り値: `Some((token, written_length))`
    pub fn pop_used(&mut self) -> Option<(T, u32)> {
        loop {
            if self.new_incoming() == 0 {
                return None;
            }
            // used.idxを読んでからエントリを読む
            fence(Ordering::Acquire);

            let slot = self.last_used_idx % self.layout.size;
            let elem = self.read_used_elem(slot);
            self.last_used_idx = self.last_used_idx.wrapping_add(1);

            match self.reclaim(elem.id) {
                Some(token) => return Some((token, elem.len)),
                None => {
                    log::error!(
                        "[VIRTQUEUE] queue {}: device returned unknown head {}",
                        self.index,
                        elem.id
                    );
                }
            }
        }
    }

    /// チェーンを空きリストへ戻し、トークンを取り出す
    fn reclaim(&mut self, id: u32) -> Option<T> {
        if id >= self.layout.size as u32 {
            return None;
        }
        let head = id as u16;
        let InFlight {
            token, chain_len, ..
        } = self.in_flight[head as usize].take()?;

        let mut idx = head;
        for i in 0..chain_len {
            self.owners[idx as usize] = DescOwner::Driver;
            if i + 1 == chain_len {
                let mut desc = self.read_desc(idx);
                desc.flags = 0;
                desc.next = self.free_head;
                self.write_desc(idx, desc);
            } else {
                idx = self.read_desc(idx).next;
            }
        }
        self.free_head = head;
        self.num_free += chain_len;

        Some(token)
    }

    /// デバイスリセット後に全トークンを取り戻す
    ///
    /// デバイスがリングを参照していないことを呼び出し側が保証する。
    pub fn drain_tokens(&mut self) -> Vec<T> {
        let mut tokens = Vec::new();
        for head in 0..self.layout.size {
            if self.in_flight[head as usize].is_some() {
                if let Some(token) = self.reclaim(head as u32) {
                    tokens.push(token);
                }
            }
        }
        self.last_used_idx = self.read_u16(self.layout.used_idx());
        self.unkicked = 0;
        tokens
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// 所有権の不変条件を検査する
    ///
    /// - 空きリスト上のディスクリプタはすべてドライバ所有で、重複がない
    /// - 使用中チェーンのディスクリプタはすべて、ちょうど1つのチェーンに属する
    /// - Usedリングの未回収区間 [last_used_idx, used.idx) は使用中チェーンの
    ///   先頭だけを重複なく含む。Used状態はこの区間にあるチェーンに限る
    /// - 未返却のチェーンは公開した位置のAvailableリングに残っており、
    ///   どのチェーンもその後の位置に再公開されていない
    pub fn audit(&self) -> Result<(), QueueError> {
        let size = self.layout.size as usize;
        let mut seen = alloc::vec![false; size];

        let mut idx = self.free_head;
        for _ in 0..self.num_free {
            let i = idx as usize;
            if i >= size || seen[i] || self.owners[i] != DescOwner::Driver {
                return Err(QueueError::OwnershipViolation(idx));
            }
            seen[i] = true;
            idx = self.read_desc(idx).next;
        }

        // デバイスが返した未回収のチェーン
        let incoming = self.new_incoming();
        if incoming > self.layout.size {
            return Err(QueueError::OwnershipViolation(incoming));
        }
        let mut returned = alloc::vec![false; size];
        for k in 0..incoming {
            let slot = self.last_used_idx.wrapping_add(k) % self.layout.size;
            let id = self.read_used_elem(slot).id;
            if self.chain_len_of(id).is_none() || returned[id as usize] {
                return Err(QueueError::OwnershipViolation(id as u16));
            }
            returned[id as usize] = true;
        }

        for head in 0..self.layout.size {
            let Some(entry) = &self.in_flight[head as usize] else {
                continue;
            };
            let is_returned = returned[head as usize];
            let mut idx = head;
            for i in 0..entry.chain_len {
                let d = idx as usize;
                let state_ok = match self.owners.get(d) {
                    Some(DescOwner::Available) => true,
                    Some(DescOwner::Used) => is_returned,
                    _ => false,
                };
                if d >= size || seen[d] || !state_ok {
                    return Err(QueueError::OwnershipViolation(idx));
                }
                seen[d] = true;
                if i + 1 < entry.chain_len {
                    idx = self.read_desc(idx).next;
                }
            }

            // 未返却なら公開した位置に残っている（上書きされていない範囲のみ）
            let age = self.avail_idx.wrapping_sub(entry.avail_pos);
            if !is_returned && age <= self.layout.size {
                let slot = entry.avail_pos % self.layout.size;
                if self.read_u16(self.layout.avail_ring(slot)) != head {
                    return Err(QueueError::OwnershipViolation(head));
                }
            }
        }

        // 使用中チェーンが公開後にもう一度Availableリングに載っていないか
        for k in 1..=self.layout.size {
            let pos = self.avail_idx.wrapping_sub(k);
            let head = self.read_u16(self.layout.avail_ring(pos % self.layout.size));
            let Some(entry) = self.in_flight.get(head as usize).and_then(Option::as_ref) else {
                continue;
            };
            if k < self.avail_idx.wrapping_sub(entry.avail_pos) {
                return Err(QueueError::OwnershipViolation(head));
            }
        }

        match seen.iter().position(|s| !s) {
            Some(orphan) => Err(QueueError::OwnershipViolation(orphan as u16)),
            None => Ok(()),
        }
    }
}

impl<T> Drop for Virtqueue<T> {
    fn drop(&mut self) {
        let mem_layout =
            Layout::from_size_align(self.layout.total_size, VIRTIO_LEGACY_ALIGN);
        if let Ok(mem_layout) = mem_layout {
            // SAFETY: new() で同じレイアウトで割り当てた
            unsafe { dealloc(self.base.as_ptr(), mem_layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// テスト用: デバイス側としてUsedリングに書き込む
    fn device_complete(vq: &mut Virtqueue<u32>, head: u16, len: u32) {
        let layout = vq.layout();
        let used_idx = vq.read_u16(layout.used_idx());
        let slot = used_idx % layout.size;
        unsafe {
            core::ptr::write_volatile(
                vq.base.as_ptr().add(layout.used_ring(slot)) as *mut VringUsedElem,
                VringUsedElem { id: head as u32, len },
            );
        }
        vq.write_u16(layout.used_idx(), used_idx.wrapping_add(1));
    }

    fn seg(addr: u64, len: u32, writable: bool) -> Segment {
        Segment {
            addr: PhysAddr::new(addr),
            len,
            writable,
        }
    }

    #[test]
    fn test_invalid_size() {
        assert!(matches!(Virtqueue::<u32>::new(0, 0), Err(QueueError::InvalidSize(0))));
        assert!(matches!(Virtqueue::<u32>::new(0, 3), Err(QueueError::InvalidSize(3))));
    }

    #[test]
    fn test_ring_is_page_aligned() {
        let vq = Virtqueue::<u32>::new(0, 16).unwrap();
        assert_eq!(vq.phys_addr().as_u64() % 4096, 0);
        assert_eq!(vq.num_free(), 16);
        vq.audit().unwrap();
    }

    #[test]
    fn test_add_publishes_chain() {
        let mut vq = Virtqueue::new(1, 8).unwrap();
        let head = vq
            .add(&[seg(0x1000, 10, false), seg(0x2000, 60, false)], 7u32)
            .map_err(|(e, _)| e)
            .unwrap();
        assert_eq!(vq.num_free(), 6);
        assert_eq!(vq.in_flight(), 2);

        let layout = vq.layout();
        assert_eq!(vq.read_u16(layout.avail_idx()), 1);
        assert_eq!(vq.read_u16(layout.avail_ring(0)), head);

        let first = vq.read_desc(head);
        assert!(first.has_next());
        assert!(!first.is_writable());
        let second = vq.read_desc(first.next);
        assert!(!second.has_next());
        assert_eq!(second.len, 60);

        assert_eq!(vq.owner(head), Some(DescOwner::Available));
        vq.audit().unwrap();
    }

    #[test]
    fn test_full_returns_token() {
        let mut vq = Virtqueue::new(0, 2).unwrap();
        vq.add(&[seg(0x1000, 1, true)], 1u32).map_err(|(e, _)| e).unwrap();
        let (err, token) = vq
            .add(&[seg(0x2000, 1, false), seg(0x3000, 1, false)], 2u32)
            .unwrap_err();
        assert_eq!(err, QueueError::Full);
        assert_eq!(token, 2);

        let (err, _) = vq.add(&[], 3u32).unwrap_err();
        assert_eq!(err, QueueError::EmptyChain);
    }

    #[test]
    fn test_pop_used_in_order() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        let a = vq.add(&[seg(0x1000, 64, true)], 10u32).map_err(|(e, _)| e).unwrap();
        let b = vq.add(&[seg(0x2000, 64, true)], 20u32).map_err(|(e, _)| e).unwrap();
        assert_eq!(vq.pop_used(), None);

        device_complete(&mut vq, b, 33);
        device_complete(&mut vq, a, 44);
        assert_eq!(vq.new_incoming(), 2);

        assert_eq!(vq.pop_used(), Some((20, 33)));
        assert_eq!(vq.pop_used(), Some((10, 44)));
        assert_eq!(vq.pop_used(), None);
        assert_eq!(vq.num_free(), 4);
        vq.audit().unwrap();
    }

    #[test]
    fn test_unknown_head_is_skipped() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        let a = vq.add(&[seg(0x1000, 64, true)], 1u32).map_err(|(e, _)| e).unwrap();
        device_complete(&mut vq, 3, 0);
        device_complete(&mut vq, a, 5);
        assert_eq!(vq.pop_used(), Some((1, 5)));
        vq.audit().unwrap();
    }

    #[test]
    fn test_take_kick_respects_no_notify() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        assert!(!vq.take_kick());

        vq.add(&[seg(0x1000, 1, false)], 1u32).map_err(|(e, _)| e).unwrap();
        vq.add(&[seg(0x1000, 1, false)], 2u32).map_err(|(e, _)| e).unwrap();
        assert_eq!(vq.unkicked(), 2);
        assert!(vq.take_kick());
        assert!(!vq.take_kick());

        let layout = vq.layout();
        vq.write_u16(layout.used_flags(), used_flags::VRING_USED_F_NO_NOTIFY);
        vq.add(&[seg(0x1000, 1, false)], 3u32).map_err(|(e, _)| e).unwrap();
        assert!(!vq.take_kick());
        assert_eq!(vq.unkicked(), 0);
    }

    #[test]
    fn test_interrupt_suppression_flag() {
        let mut vq = Virtqueue::<u32>::new(0, 4).unwrap();
        vq.disable_interrupts();
        assert!(vq.interrupts_disabled());
        vq.enable_interrupts();
        assert!(!vq.interrupts_disabled());
    }

    #[test]
    fn test_audit_detects_corruption() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        vq.add(&[seg(0x1000, 1, true)], 1u32).map_err(|(e, _)| e).unwrap();
        vq.owners[0] = DescOwner::Driver;
        assert!(matches!(vq.audit(), Err(QueueError::OwnershipViolation(_))));
    }

    #[test]
    fn test_observe_used_marks_returned_chains() {
        let mut vq = Virtqueue::new(0, 8).unwrap();
        let a = vq
            .add(&[seg(0x1000, 10, false), seg(0x2000, 60, false)], 1u32)
            .map_err(|(e, _)| e)
            .unwrap();
        let b = vq.add(&[seg(0x3000, 64, true)], 2u32).map_err(|(e, _)| e).unwrap();

        device_complete(&mut vq, a, 0);
        vq.audit().unwrap();
        assert_eq!(vq.observe_used(), 1);
        assert_eq!(vq.owner(a), Some(DescOwner::Used));
        assert_eq!(vq.owner(vq.read_desc(a).next), Some(DescOwner::Used));
        assert_eq!(vq.owner(b), Some(DescOwner::Available));
        vq.audit().unwrap();

        assert_eq!(vq.pop_used(), Some((1, 0)));
        assert_eq!(vq.owner(a), Some(DescOwner::Driver));
        vq.audit().unwrap();
    }

    #[test]
    fn test_audit_detects_used_head_published_again() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        let a = vq.add(&[seg(0x1000, 1, true)], 1u32).map_err(|(e, _)| e).unwrap();
        vq.add(&[seg(0x2000, 1, true)], 2u32).map_err(|(e, _)| e).unwrap();
        device_complete(&mut vq, a, 1);
        vq.observe_used();
        vq.audit().unwrap();

        // 返却済みの先頭をもう一度Availableリングへ載せる
        let layout = vq.layout();
        let slot = vq.avail_idx % layout.size;
        vq.write_u16(layout.avail_ring(slot), a);
        vq.avail_idx = vq.avail_idx.wrapping_add(1);
        assert_eq!(vq.audit(), Err(QueueError::OwnershipViolation(a)));
    }

    #[test]
    fn test_audit_detects_duplicate_used_entry() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        let a = vq.add(&[seg(0x1000, 1, true)], 1u32).map_err(|(e, _)| e).unwrap();
        device_complete(&mut vq, a, 1);
        device_complete(&mut vq, a, 1);
        assert_eq!(vq.audit(), Err(QueueError::OwnershipViolation(a)));
    }

    #[test]
    fn test_audit_detects_withdrawn_available_entry() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        vq.add(&[seg(0x1000, 1, true)], 1u32).map_err(|(e, _)| e).unwrap();
        let b = vq.add(&[seg(0x2000, 1, true)], 2u32).map_err(|(e, _)| e).unwrap();
        let layout = vq.layout();
        vq.write_u16(layout.avail_ring(1), 3);
        assert_eq!(vq.audit(), Err(QueueError::OwnershipViolation(b)));
    }

    #[test]
    fn test_used_state_outside_used_window_is_violation() {
        let mut vq = Virtqueue::new(0, 4).unwrap();
        let a = vq.add(&[seg(0x1000, 1, true)], 1u32).map_err(|(e, _)| e).unwrap();
        vq.owners[a as usize] = DescOwner::Used;
        assert_eq!(vq.audit(), Err(QueueError::OwnershipViolation(a)));
    }

    #[test]
    fn test_drain_tokens() {
        let mut vq = Virtqueue::new(0, 8).unwrap();
        for t in 0..3u32 {
            vq.add(&[seg(0x1000, 1, true)], t).map_err(|(e, _)| e).unwrap();
        }
        let mut tokens = vq.drain_tokens();
        tokens.sort();
        assert_eq!(tokens, alloc::vec![0, 1, 2]);
        assert_eq!(vq.num_free(), 8);
        vq.audit().unwrap();
    }
}
