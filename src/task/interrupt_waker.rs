// ============================================================================
// src/task/interrupt_waker.rs - Interrupt-Waker Bridge
//
// ハードウェア割り込みとRustのasync/await Futureを連携させる機構
// ISRはイベントビットを記録してWakerを起動するだけで、
// 実際のキュー処理はタスク側（単一のコンシューマ）で行う
// ============================================================================

use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};
use spin::Mutex;

// ============================================================================
// Atomic Waker - ISR-safe Waker storage
// ============================================================================

/// ISR-safe な Waker ストレージ
///
/// 割り込みハンドラ内から安全にWakerを操作できる
pub struct AtomicWaker {
    /// Wakerが設定されているか
    has_waker: AtomicBool,
    /// Waker (Mutex保護)
    waker: Mutex<Option<Waker>>,
    /// Wake要求フラグ（ISRから設定）
    wake_requested: AtomicBool,
}

impl AtomicWaker {
    pub const fn new() -> Self {
        Self {
            has_waker: AtomicBool::new(false),
            waker: Mutex::new(None),
            wake_requested: AtomicBool::new(false),
        }
    }

    /// Wakerを登録
    pub fn register(&self, waker: &Waker) {
        let mut guard = self.waker.lock();
        let should_update = match &*guard {
            Some(existing) => !existing.will_wake(waker),
            None => true,
        };

        if should_update {
            *guard = Some(waker.clone());
            self.has_waker.store(true, Ordering::Release);
        }

        // 保留中のwake要求があれば処理
        if self.wake_requested.swap(false, Ordering::AcqRel) {
            if let Some(w) = guard.take() {
                self.has_waker.store(false, Ordering::Release);
                drop(guard);
                w.wake();
            }
        }
    }

    /// Wakerを起動（ISRから呼ばれる）
    ///
    /// ロック取得に失敗した場合はwake_requestedフラグを設定して、
    /// 次のregister時にwakeする
    pub fn wake(&self) {
        if let Some(mut guard) = self.waker.try_lock() {
            if let Some(waker) = guard.take() {
                self.has_waker.store(false, Ordering::Release);
                drop(guard);
                waker.wake();
                return;
            }
        }

        if self.has_waker.load(Ordering::Acquire) {
            self.wake_requested.store(true, Ordering::Release);
        }
    }

    /// Wakerが登録されているか
    pub fn has_waker(&self) -> bool {
        self.has_waker.load(Ordering::Acquire)
    }
}

impl Default for AtomicWaker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// IRQ Event Channel
// ============================================================================

/// 割り込み → タスクのイベントチャネル
///
/// ISRは発生源のビットをORで積み、コンシューマはまとめて取り出す。
/// 同じビットが処理前に複数回立っても1回の処理にまとまる。
pub struct IrqEventChannel {
    /// 未処理のイベントビット
    pending: AtomicU8,
    /// コンシューマのWaker
    waker: AtomicWaker,
    /// 統計: raise回数
    raised: AtomicU64,
}

impl IrqEventChannel {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
            waker: AtomicWaker::new(),
            raised: AtomicU64::new(0),
        }
    }

    /// イベントを記録してコンシューマを起こす（ISRから呼ばれる）
    pub fn raise(&self, bits: u8) {
        if bits == 0 {
            return;
        }
        self.pending.fetch_or(bits, Ordering::AcqRel);
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }

    /// 未処理のイベントをすべて取り出す
    pub fn take(&self) -> u8 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// 未処理のイベントがあるか
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// raise回数
    pub fn raised_count(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }

    /// 次のイベントを待つFuture
    pub fn wait(&self) -> IrqEventFuture<'_> {
        IrqEventFuture { channel: self }
    }
}

impl Default for IrqEventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// イベント待ちFuture（出力は取り出したビット）
pub struct IrqEventFuture<'a> {
    channel: &'a IrqEventChannel,
}

impl Future for IrqEventFuture<'_> {
    type Output = u8;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u8> {
        let bits = self.channel.take();
        if bits != 0 {
            return Poll::Ready(bits);
        }

        self.channel.waker.register(cx.waker());

        // 登録前に届いたイベントを取りこぼさない
        let bits = self.channel.take();
        if bits != 0 {
            Poll::Ready(bits)
        } else {
            Poll::Pending
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_waker() {
        let atomic_waker = AtomicWaker::new();
        let waker = Waker::noop();

        assert!(!atomic_waker.has_waker());

        atomic_waker.register(waker);
        assert!(atomic_waker.has_waker());

        atomic_waker.wake();
        assert!(!atomic_waker.has_waker());
    }

    #[test]
    fn test_channel_merges_bits() {
        let channel = IrqEventChannel::new();
        channel.raise(0b001);
        channel.raise(0b100);
        channel.raise(0b001);
        assert_eq!(channel.raised_count(), 3);
        assert_eq!(channel.take(), 0b101);
        assert_eq!(channel.take(), 0);
    }

    #[test]
    fn test_wait_future() {
        let channel = IrqEventChannel::new();
        let mut cx = Context::from_waker(Waker::noop());

        let mut fut = channel.wait();
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending);
        assert!(channel.waker.has_waker());

        channel.raise(0b010);
        assert_eq!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(0b010));
    }
}
