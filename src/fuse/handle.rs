//! fuse/handle — файловые и каталожные хэндлы поверхности.
//!
//! Хэндл держит ссылку на базу, тип файла и собственные уровни по трём
//! именованным блокировкам. Переходы выполняются под мьютексом базы;
//! при release всё удерживаемое снимается (поведение закрытия дескриптора).

use std::sync::Arc;

use crate::db::{Db, FileType, HandleLockState, LockLevel, LockName};

pub struct FileHandle {
    id: u64,
    db: Arc<Db>,
    file_type: FileType,
    locks: HandleLockState,
}

impl FileHandle {
    pub fn new(id: u64, db: Arc<Db>, file_type: FileType) -> Self {
        Self {
            id,
            db,
            file_type,
            locks: HandleLockState::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Возможен ли переход всех указанных блокировок на уровень `to`
    /// (без выполнения).
    pub fn getlk(&self, to: LockLevel, names: &[LockName]) -> bool {
        let locks = &self.locks;
        self.db
            .with_locks_mutex(|table| table.can_set(locks, to, names))
    }

    /// Атомарно перевести все указанные блокировки на уровень `to`.
    pub fn setlk(&mut self, to: LockLevel, names: &[LockName]) -> bool {
        let db = self.db.clone();
        let locks = &mut self.locks;
        db.with_locks_mutex(|table| table.try_set(locks, to, names))
    }

    /// Снять всё удерживаемое (закрытие хэндла).
    pub fn release_locks(&mut self) {
        if !self.locks.holds_any() {
            return;
        }
        let db = self.db.clone();
        let locks = &mut self.locks;
        db.with_locks_mutex(|table| table.release_all(locks));
    }
}

/// Хэндл корневого каталога: только смещение перечисления.
pub struct DirHandle {
    id: u64,
}

impl DirHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
