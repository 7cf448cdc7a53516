// ============================================================================
// src/sync/irq_mutex.rs - 割り込み禁止Mutex
//
// 問題: spin::Mutex はロック中でも割り込みを許可する
// → 割り込みハンドラが同じMutexをロックしようとするとデッドロック
//
// 解決: ロック取得時に割り込みを禁止し、解放時に元の状態へ復元する
//
// ベアメタルx86_64では x86_64::instructions::interrupts を使用する。
// ホスト環境（ユーザーモード、テスト）では cli/sti が特権命令なので
// 割り込み操作はno-opとなり、純粋なスピンロックとして振る舞う。
// ============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use x86_64::instructions::interrupts;

    #[inline]
    pub fn save_and_disable() -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    #[inline]
    pub fn restore(was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub fn save_and_disable() -> bool {
        false
    }

    #[inline]
    pub fn restore(_was_enabled: bool) {}
}

/// 割り込み禁止Mutex
///
/// ロック取得時に自動的に割り込みを禁止し、
/// ロック解放時に元の状態に復元する。
///
/// # 割り込みハンドラからの使用
/// ハンドラ内でロックしても、フォアグラウンド側が保持している間は
/// 割り込み自体が届かないため、同一CPU上でデッドロックしない。
pub struct IrqMutex<T: ?Sized> {
    /// スピンロック本体
    locked: AtomicBool,
    /// 保護されるデータ
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex は排他的アクセスを保証する
unsafe impl<T: ?Sized + Send> Sync for IrqMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqMutex<T> {}

impl<T> IrqMutex<T> {
    /// 新しい IrqMutex を作成
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// 中身を取り出す
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// ロックを取得
    ///
    /// 割り込みを禁止してからスピンロックを取得する。
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq_was_enabled = arch::save_and_disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqMutexGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// ロックを試行（失敗したら即座に返る）
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq_was_enabled = arch::save_and_disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqMutexGuard {
                lock: self,
                irq_was_enabled,
            })
        } else {
            arch::restore(irq_was_enabled);
            None
        }
    }

    /// ロック状態を確認（デバッグ用）
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// IrqMutex のガード
///
/// ドロップ時にロックを解放し、割り込み状態を復元する。
pub struct IrqMutexGuard<'a, T: ?Sized> {
    lock: &'a IrqMutex<T>,
    irq_was_enabled: bool,
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ロックを保持しているので安全にアクセス可能
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        arch::restore(self.irq_was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_mutex_basic() {
        let mutex = IrqMutex::new(42u64);

        {
            let mut guard = mutex.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
        }

        {
            let guard = mutex.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_try_lock() {
        let mutex = IrqMutex::new(0u64);

        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none()); // 既にロック中
        drop(guard);

        assert!(mutex.try_lock().is_some()); // 解放後は取得可能
    }
}
