// ============================================================================
// src/task/tick.rs - End-of-Tick Deferred Work
// ============================================================================
//!
//! イベントループの1周（tick）の最後にまとめて実行する処理の登録先
//!
//! ドライバはtick中に何度でも作業を要求できるが、ディスパッチャへの登録は
//! 呼び出し側が1回に絞る（[`crate::io::virtio::net::kick::KickScheduler`]）。
//! 実行中に新たに登録された作業は次のtickに回る。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::IrqMutex;

/// tick終了時に実行される作業
pub trait DeferredWork: Send + Sync {
    fn run_deferred(&self);
}

/// tick終了時ディスパッチャ
pub struct TickDispatcher {
    /// 今tickに登録された作業
    queue: IrqMutex<Vec<Arc<dyn DeferredWork>>>,
    /// 完了したtick数
    ticks: AtomicU64,
}

impl TickDispatcher {
    pub const fn new() -> Self {
        Self {
            queue: IrqMutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
        }
    }

    /// 作業を登録
    pub fn schedule(&self, work: Arc<dyn DeferredWork>) {
        self.queue.lock().push(work);
    }

    /// 登録済みの作業数
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// 完了したtick数
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// tickの終わりに呼ぶ。実行した作業数を返す
    pub fn run_end_of_tick(&self) -> usize {
        // ロックを保持したまま作業を実行しない
        let batch = core::mem::take(&mut *self.queue.lock());
        let count = batch.len();
        for work in batch {
            work.run_deferred();
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        count
    }
}

impl Default for TickDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Counter {
        runs: AtomicUsize,
        dispatcher: Arc<TickDispatcher>,
        reschedule: bool,
    }

    impl DeferredWork for Counter {
        fn run_deferred(&self) {
            self.runs.fetch_add(1, Ordering::Relaxed);
            if self.reschedule {
                self.dispatcher.schedule(Arc::new(Counter {
                    runs: AtomicUsize::new(0),
                    dispatcher: self.dispatcher.clone(),
                    reschedule: false,
                }));
            }
        }
    }

    #[test]
    fn test_runs_once_per_registration() {
        let dispatcher = Arc::new(TickDispatcher::new());
        let work = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            dispatcher: dispatcher.clone(),
            reschedule: false,
        });
        dispatcher.schedule(work.clone());
        assert_eq!(dispatcher.pending(), 1);

        assert_eq!(dispatcher.run_end_of_tick(), 1);
        assert_eq!(work.runs.load(Ordering::Relaxed), 1);
        assert_eq!(dispatcher.run_end_of_tick(), 0);
        assert_eq!(dispatcher.ticks(), 2);
    }

    #[test]
    fn test_work_scheduled_during_run_waits_for_next_tick() {
        let dispatcher = Arc::new(TickDispatcher::new());
        dispatcher.schedule(Arc::new(Counter {
            runs: AtomicUsize::new(0),
            dispatcher: dispatcher.clone(),
            reschedule: true,
        }));

        assert_eq!(dispatcher.run_end_of_tick(), 1);
        assert_eq!(dispatcher.pending(), 1);
        assert_eq!(dispatcher.run_end_of_tick(), 1);
    }
}
