// ============================================================================
// src/sync/service_gate.rs - キューサービスの再入防止ゲート
// ============================================================================
//!
//! 同一キューのサービスルーチンが、上位層へのコールバック中に届いた
//! 割り込みによって入れ子で実行されるのを防ぐ。
//!
//! 入れ子の要求は「再実行要求」に変換され、実行中のサービスが
//! ループをもう一周することで処理される。これにより、配送順序が
//! 入れ子実行によって入れ替わることがない。

use core::sync::atomic::{AtomicBool, Ordering};

/// キューごとのサービスゲート
pub struct ServiceGate {
    /// サービス実行中フラグ
    running: AtomicBool,
    /// 実行中に届いた再実行要求
    rerun: AtomicBool,
}

impl ServiceGate {
    pub const fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    /// サービスの開始を試みる
    ///
    /// 既に実行中なら再実行要求を残して `false` を返す。
    pub fn enter(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            self.rerun.store(true, Ordering::Release);
            return false;
        }
        self.rerun.store(false, Ordering::Release);
        true
    }

    /// サービスの終了を試みる
    ///
    /// 再実行要求が残っていれば `false` を返し、呼び出し側はもう一周する。
    /// `true` のときゲートは解放済み。
    pub fn leave(&self) -> bool {
        if self.rerun.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.running.store(false, Ordering::Release);

        // 解放直前に届いた要求を取りこぼさない
        if self.rerun.swap(false, Ordering::AcqRel) && !self.running.swap(true, Ordering::AcqRel)
        {
            return false;
        }
        true
    }

    /// 実行中かどうか
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Default for ServiceGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pass() {
        let gate = ServiceGate::new();
        assert!(gate.enter());
        assert!(gate.is_running());
        assert!(gate.leave());
        assert!(!gate.is_running());
    }

    #[test]
    fn test_nested_request_becomes_rerun() {
        let gate = ServiceGate::new();
        assert!(gate.enter());

        // 入れ子の割り込みは入れない
        assert!(!gate.enter());

        // 外側はもう一周する
        assert!(!gate.leave());
        assert!(gate.is_running());
        assert!(gate.leave());
        assert!(!gate.is_running());
    }
}
