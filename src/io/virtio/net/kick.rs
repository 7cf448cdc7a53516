// ============================================================================
// src/io/virtio/net/kick.rs - Deferred Kick Scheduler
// ============================================================================
//!
//! デバイスへの通知（キック）をtickの終わりにまとめる
//!
//! 1tick中に何回要求があっても、ディスパッチャへの登録は最初の1回だけ。
//! フラグは実行時にクリアされるので、次のtickではまた登録される。

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::task::tick::{DeferredWork, TickDispatcher};

/// 遅延キックスケジューラ
pub struct KickScheduler {
    /// 今tickで登録済みか
    requested: AtomicBool,
    dispatcher: Arc<TickDispatcher>,
    /// tick終了時に実行される作業（デバイス本体）
    target: Weak<dyn DeferredWork>,
}

impl KickScheduler {
    pub fn new(dispatcher: Arc<TickDispatcher>, target: Weak<dyn DeferredWork>) -> Self {
        Self {
            requested: AtomicBool::new(false),
            dispatcher,
            target,
        }
    }

    /// キックを要求する
    ///
    /// このtickで初めての要求ならディスパッチャに登録して `true` を返す。
    pub fn request_kick(&self) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.target.upgrade() {
            Some(target) => {
                self.dispatcher.schedule(target);
                true
            }
            None => {
                // デバイスは破棄済み
                self.requested.store(false, Ordering::Release);
                false
            }
        }
    }

    /// 要求フラグを取り出してクリアする（tick終了時の作業から呼ぶ）
    pub fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    /// 要求済みか
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Flush {
        runs: AtomicUsize,
    }

    impl DeferredWork for Flush {
        fn run_deferred(&self) {
            self.runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_one_registration_per_tick() {
        let dispatcher = Arc::new(TickDispatcher::new());
        let flush = Arc::new(Flush {
            runs: AtomicUsize::new(0),
        });
        let target: Arc<dyn DeferredWork> = flush.clone();
        let kick = KickScheduler::new(dispatcher.clone(), Arc::downgrade(&target));

        assert!(kick.request_kick());
        for _ in 0..5 {
            assert!(!kick.request_kick());
        }
        assert_eq!(dispatcher.pending(), 1);

        // 本来はrun_deferredの中でtake_requestする
        assert!(kick.take_request());
        dispatcher.run_end_of_tick();
        assert_eq!(flush.runs.load(Ordering::Relaxed), 1);

        assert!(kick.request_kick());
        assert_eq!(dispatcher.pending(), 1);
    }

    #[test]
    fn test_dropped_target_is_not_scheduled() {
        let dispatcher = Arc::new(TickDispatcher::new());
        let target: Arc<dyn DeferredWork> = Arc::new(Flush {
            runs: AtomicUsize::new(0),
        });
        let kick = KickScheduler::new(dispatcher.clone(), Arc::downgrade(&target));
        drop(target);

        assert!(!kick.request_kick());
        assert!(!kick.is_requested());
        assert_eq!(dispatcher.pending(), 0);
    }
}
