//! db — сущность базы данных и её наблюдатели.
//!
//! Разделение по подмодулям:
//! - core.rs     — структура Db, пул дескрипторов, защищённое состояние
//! - locks.rs    — именованные advisory-блокировки (pending/reserved/shared)
//! - journal.rs  — наблюдатель rollback-журнала (коммит/откат)
//! - wal.rs      — наблюдатель WAL (скан кадров, рестарт-синхронизация)
//! - write.rs    — записи в файл базы/shm, усечения
//! - apply.rs    — применение дельта-записей (путь реплики)
//! - snapshot.rs — самодостаточные снапшоты (write_snapshot_to/import)
//! - open.rs     — восстановление при открытии

pub mod apply;
pub mod core;
pub mod journal;
pub mod locks;
pub mod open;
pub mod snapshot;
pub mod wal;
pub mod write;

pub use self::core::{Db, FileType};
pub use locks::{DbLock, HandleLockState, LockLevel, LockName, LockTable, LOCK_NAMES};
