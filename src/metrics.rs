//! Lightweight global metrics for quiverfs.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - транзакции (локальные коммиты, страницы, байты LTX)
//! - реплика (применённые удалённые записи)
//! - инвалидация страничного кэша ядра
//! - блокировки (отказы Busy)
//! - восстановление (rollback незавершённых журналов)
//! - компактация каталога лога

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Local commits -----
static TXN_COMMITS: AtomicU64 = AtomicU64::new(0);
static TXN_PAGES: AtomicU64 = AtomicU64::new(0);
static LTX_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ----- Replica apply -----
static REMOTE_TXNS_APPLIED: AtomicU64 = AtomicU64::new(0);
static REMOTE_BYTES_APPLIED: AtomicU64 = AtomicU64::new(0);

// ----- Kernel cache invalidation -----
static INVALIDATIONS: AtomicU64 = AtomicU64::new(0);

// ----- Locks -----
static LOCK_DENIALS: AtomicU64 = AtomicU64::new(0);

// ----- Recovery / maintenance -----
static JOURNAL_ROLLBACKS: AtomicU64 = AtomicU64::new(0);
static LOG_COMPACTIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub txn_commits: u64,
    pub txn_pages: u64,
    pub ltx_bytes_written: u64,

    pub remote_txns_applied: u64,
    pub remote_bytes_applied: u64,

    pub invalidations: u64,
    pub lock_denials: u64,

    pub journal_rollbacks: u64,
    pub log_compactions: u64,
}

/// Снять консистентный (по счётчику) снапшот метрик.
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        txn_commits: TXN_COMMITS.load(Ordering::Relaxed),
        txn_pages: TXN_PAGES.load(Ordering::Relaxed),
        ltx_bytes_written: LTX_BYTES_WRITTEN.load(Ordering::Relaxed),
        remote_txns_applied: REMOTE_TXNS_APPLIED.load(Ordering::Relaxed),
        remote_bytes_applied: REMOTE_BYTES_APPLIED.load(Ordering::Relaxed),
        invalidations: INVALIDATIONS.load(Ordering::Relaxed),
        lock_denials: LOCK_DENIALS.load(Ordering::Relaxed),
        journal_rollbacks: JOURNAL_ROLLBACKS.load(Ordering::Relaxed),
        log_compactions: LOG_COMPACTIONS.load(Ordering::Relaxed),
    }
}

pub fn record_txn_commit(pages: u64, ltx_bytes: u64) {
    TXN_COMMITS.fetch_add(1, Ordering::Relaxed);
    TXN_PAGES.fetch_add(pages, Ordering::Relaxed);
    LTX_BYTES_WRITTEN.fetch_add(ltx_bytes, Ordering::Relaxed);
}

pub fn record_remote_apply(bytes: u64) {
    REMOTE_TXNS_APPLIED.fetch_add(1, Ordering::Relaxed);
    REMOTE_BYTES_APPLIED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_invalidation() {
    INVALIDATIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_lock_denial() {
    LOCK_DENIALS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_journal_rollback() {
    JOURNAL_ROLLBACKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_log_compaction() {
    LOG_COMPACTIONS.fetch_add(1, Ordering::Relaxed);
}
