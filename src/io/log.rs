// ============================================================================
// src/io/log.rs - Driver Logging using the `log` crate
// ============================================================================
//!
//! ドライバ用ロギング。
//!
//! ## 機能
//! - `log`クレートを使用した標準的なログインターフェース
//! - 出力先は [`LogSink`] で差し替え可能（シリアル、メモリリング）
//! - コンパイル時のログレベルフィルタリング（`verbose_logging` feature）
//! - 割り込みコンテキストからも安全なSpinlock保護
//!
//! ## 使用方法
//! ```ignore
//! static SINK: RingSink = RingSink::new(256);
//! static LOGGER: DriverLogger<&RingSink> = DriverLogger::new(&SINK);
//! rany_virtio_net::io::log::init(&LOGGER)?;
//! log::info!("[VIRTIO-NET] ready");
//! ```

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{AtomicU8, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

// ============================================================================
// ログレベル定義
// ============================================================================

/// コンパイル時のログレベル（featureで変更可能）
#[cfg(feature = "verbose_logging")]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(not(feature = "verbose_logging"))]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// ============================================================================
// 出力先
// ============================================================================

/// ログの出力先
pub trait LogSink: Send + Sync {
    /// 1行分を書き込む（改行は含まない）
    fn write_line(&self, line: &str);
}

impl<S: LogSink + ?Sized> LogSink for &S {
    fn write_line(&self, line: &str) {
        (**self).write_line(line)
    }
}

/// メモリ上のリングに保持する出力先
///
/// 容量を超えると古い行から捨てる。
pub struct RingSink {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RingSink {
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::new()),
        }
    }

    /// 保持している行をすべて取り出す
    pub fn drain(&self) -> Vec<String> {
        self.lines.lock().drain(..).collect()
    }

    /// 保持している行数
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for RingSink {
    fn write_line(&self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(String::from(line));
    }
}

/// COM1シリアルポートへの出力先
#[cfg(target_arch = "x86_64")]
pub struct SerialSink {
    lock: Mutex<()>,
}

#[cfg(target_arch = "x86_64")]
impl SerialSink {
    /// シリアルポートベースアドレス (COM1)
    const BASE: u16 = 0x3F8;
    /// 送信バッファ空きビット (LSR bit 5)
    const LSR_TX_EMPTY: u8 = 0x20;
    /// 送信待機タイムアウト（ループ回数）
    const TX_TIMEOUT_LOOPS: u32 = 100_000;

    /// # Safety
    /// COM1が初期化済みで、他に直接書き込むコードがないこと
    pub const unsafe fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    fn write_byte(byte: u8) {
        use x86_64::instructions::port::Port;
        let mut status: Port<u8> = Port::new(Self::BASE + 5);
        let mut data: Port<u8> = Port::new(Self::BASE);
        // SAFETY: new() の契約によりCOM1はこのシンク専用
        unsafe {
            let mut timeout = Self::TX_TIMEOUT_LOOPS;
            while status.read() & Self::LSR_TX_EMPTY == 0 && timeout > 0 {
                core::hint::spin_loop();
                timeout -= 1;
            }
            if timeout > 0 {
                data.write(byte);
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl LogSink for SerialSink {
    fn write_line(&self, line: &str) {
        let _guard = self.lock.lock();
        for byte in line.bytes() {
            Self::write_byte(byte);
        }
        Self::write_byte(b'\r');
        Self::write_byte(b'\n');
    }
}

// ============================================================================
// ロガー実装
// ============================================================================

/// 1行の最大長（超過分は切り捨て）
const MAX_LINE: usize = 256;

/// 固定長バッファへのフォーマッタ
struct LineBuffer {
    buf: [u8; MAX_LINE],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; MAX_LINE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.buf[..self.len]) {
            Ok(s) => s,
            // 切り捨てでUTF-8境界が壊れた場合は有効な部分まで
            Err(e) => core::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = MAX_LINE - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// ドライバ用ロガー
///
/// ヒープを使わずに1行を組み立てて [`LogSink`] に渡す。
pub struct DriverLogger<S: LogSink> {
    sink: S,
    /// 現在のログレベル（実行時変更可能）
    level: AtomicU8,
}

impl<S: LogSink> DriverLogger<S> {
    pub const fn new(sink: S) -> Self {
        Self {
            sink,
            level: AtomicU8::new(MAX_LOG_LEVEL as u8),
        }
    }

    /// 実行時にログレベルを変更（コンパイル時上限を超えない）
    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level.min(MAX_LOG_LEVEL) as u8, Ordering::Relaxed);
    }

    /// 現在のログレベル
    pub fn level(&self) -> LevelFilter {
        LevelFilter::iter()
            .nth(self.level.load(Ordering::Relaxed) as usize)
            .unwrap_or(LevelFilter::Info)
    }

    /// 出力先
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// ログレベルのプレフィックスを取得
    fn level_prefix(level: Level) -> &'static str {
        match level {
            Level::Error => "[ERROR] ",
            Level::Warn => "[WARN]  ",
            Level::Info => "[INFO]  ",
            Level::Debug => "[DEBUG] ",
            Level::Trace => "[TRACE] ",
        }
    }
}

impl<S: LogSink> Log for DriverLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = LineBuffer::new();
        let _ = line.write_str(Self::level_prefix(record.level()));
        let _ = write!(line, "{}", record.args());
        self.sink.write_line(line.as_str());
    }

    fn flush(&self) {}
}

// ============================================================================
// 公開API
// ============================================================================

/// グローバルロガーを登録する
pub fn init(logger: &'static dyn Log) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(MAX_LOG_LEVEL);
    Ok(())
}
