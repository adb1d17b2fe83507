//! db/core — сущность базы данных: файлы, защищённое состояние, позиция.
//!
//! Каждая база — каталог dbs/<id:08x>/ с файлами name/database/journal/
//! wal/shm и подкаталогом ltx/. Дескрипторы backing-файлов пулируются на
//! базу; все чтения/записи идут через pread/pwrite (FileExt), без seek.
//!
//! Всё изменяемое состояние (позиция, наблюдатели журнала/WAL, таблица
//! блокировок) лежит в одном Mutex<DbState>: грубая блокировка на базу,
//! без глобального лока между базами.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::journal::JournalObserver;
use crate::db::locks::LockTable;
use crate::db::wal::WalObserver;
use crate::error::Error;
use crate::metrics::record_invalidation;
use crate::pos::Pos;
use crate::remote::Invalidator;

pub const FILE_NAME: &str = "name";
pub const FILE_DATABASE: &str = "database";
pub const FILE_JOURNAL: &str = "journal";
pub const FILE_WAL: &str = "wal";
pub const FILE_SHM: &str = "shm";
pub const LTX_DIR_NAME: &str = "ltx";

/// Типы видимых файлов базы. Pos — синтетический (не имеет backing-файла).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Database,
    Journal,
    Wal,
    Shm,
    Pos,
}

impl FileType {
    /// Имя backing-файла внутри каталога базы (None для синтетики).
    pub fn storage_name(&self) -> Option<&'static str> {
        match self {
            FileType::Database => Some(FILE_DATABASE),
            FileType::Journal => Some(FILE_JOURNAL),
            FileType::Wal => Some(FILE_WAL),
            FileType::Shm => Some(FILE_SHM),
            FileType::Pos => None,
        }
    }
}

/// Слот обратного вызова инвалидации (заполняется поверхностью ФС после
/// монтирования; до этого инвалидация — no-op).
pub type InvalidatorSlot = Arc<Mutex<Option<Arc<dyn Invalidator>>>>;

/// Изменяемое состояние базы под мьютексом.
pub(crate) struct DbState {
    pub pos: Pos,
    /// 0 — размер страницы ещё не определён (пустая база).
    pub page_size: u32,
    /// Размер базы в страницах после последней транзакции.
    pub page_count: u32,
    /// Запись в базу вне сессии журнала/WAL; снимается ближайшим коммитом.
    pub dirty: bool,
    /// Страницы, записанные вне сессии: ближайший коммит обязан нести их
    /// кадрами, иначе лог не воспроизводит состояние.
    pub dirty_pages: BTreeSet<u32>,
    pub journal: JournalObserver,
    pub wal: WalObserver,
    pub locks: LockTable,
}

impl DbState {
    fn new() -> Self {
        Self {
            pos: Pos::default(),
            page_size: 0,
            page_count: 0,
            dirty: false,
            dirty_pages: BTreeSet::new(),
            journal: JournalObserver::default(),
            wal: WalObserver::default(),
            locks: LockTable::default(),
        }
    }
}

pub struct Db {
    id: u32,
    name: String,
    path: PathBuf,
    pub(crate) data_fsync: bool,
    pub(crate) invalidator: InvalidatorSlot,
    pub(crate) state: Mutex<DbState>,
    files: Mutex<HashMap<FileType, Arc<File>>>,
}

impl Db {
    pub(crate) fn new(
        id: u32,
        name: String,
        path: PathBuf,
        data_fsync: bool,
        invalidator: InvalidatorSlot,
    ) -> Self {
        Self {
            id,
            name,
            path,
            data_fsync,
            invalidator,
            state: Mutex::new(DbState::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ltx_dir(&self) -> PathBuf {
        self.path.join(LTX_DIR_NAME)
    }

    pub fn ltx_path(&self, min_txid: u64, max_txid: u64) -> PathBuf {
        self.ltx_dir()
            .join(crate::ltx::dir::ltx_filename(min_txid, max_txid))
    }

    /// Текущая позиция (короткое взятие мьютекса).
    pub fn pos(&self) -> Pos {
        self.state.lock().unwrap().pos
    }

    pub fn txid(&self) -> u64 {
        self.pos().txid
    }

    pub fn page_size(&self) -> u32 {
        self.state.lock().unwrap().page_size
    }

    /// Размер базы в страницах после последней транзакции.
    pub fn page_count(&self) -> u32 {
        self.state.lock().unwrap().page_count
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap()
    }

    /// Выполнить f под мьютексом таблицы блокировок (он же мьютекс базы).
    pub fn with_locks_mutex<R>(&self, f: impl FnOnce(&mut LockTable) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        f(&mut st.locks)
    }

    /// Снимок таблицы блокировок (pending/reserved/shared).
    pub fn locks(&self) -> LockTable {
        self.state.lock().unwrap().locks
    }

    // -------- пул дескрипторов backing-файлов --------

    fn raw_path(&self, ft: FileType) -> Result<PathBuf> {
        let name = ft
            .storage_name()
            .ok_or_else(|| anyhow!(Error::Invalid).context("no backing file for file type"))?;
        Ok(self.path.join(name))
    }

    /// Дескриптор backing-файла из пула; файл должен существовать.
    pub(crate) fn file(&self, ft: FileType) -> Result<Arc<File>> {
        let mut files = self.files.lock().unwrap();
        if let Some(f) = files.get(&ft) {
            return Ok(f.clone());
        }
        let path = self.raw_path(ft)?;
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let f = Arc::new(f);
        files.insert(ft, f.clone());
        Ok(f)
    }

    /// Дескриптор backing-файла, создавая файл при отсутствии.
    pub(crate) fn file_or_create(&self, ft: FileType) -> Result<Arc<File>> {
        {
            let files = self.files.lock().unwrap();
            if let Some(f) = files.get(&ft) {
                return Ok(f.clone());
            }
        }
        let path = self.raw_path(ft)?;
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        let f = Arc::new(f);
        self.files.lock().unwrap().insert(ft, f.clone());
        Ok(f)
    }

    /// Существует ли backing-файл (для lookup/readdir).
    pub fn file_exists(&self, ft: FileType) -> bool {
        match ft {
            FileType::Pos => true,
            _ => self
                .raw_path(ft)
                .map(|p| p.exists())
                .unwrap_or(false),
        }
    }

    /// Размер видимого файла (для getattr).
    pub fn file_size(&self, ft: FileType) -> Result<u64> {
        match ft {
            FileType::Pos => Ok(crate::pos::POS_STR_LEN as u64),
            _ => {
                let path = self.raw_path(ft)?;
                let md = std::fs::metadata(&path)
                    .with_context(|| format!("stat {}", path.display()))?;
                Ok(md.len())
            }
        }
    }

    /// Чтение видимого файла. Возвращает число прочитанных байт
    /// (0 на EOF). Для "-pos" отдаётся форматированная позиция.
    pub fn read_file_at(&self, ft: FileType, buf: &mut [u8], off: u64) -> Result<usize> {
        if ft == FileType::Pos {
            let bytes = self.pos().format_bytes();
            if off >= bytes.len() as u64 {
                return Ok(0);
            }
            let n = (bytes.len() as u64 - off).min(buf.len() as u64) as usize;
            buf[..n].copy_from_slice(&bytes[off as usize..off as usize + n]);
            return Ok(n);
        }
        let f = self.file(ft)?;
        let mut read = 0usize;
        while read < buf.len() {
            match f.read_at(&mut buf[read..], off + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(anyhow!(e).context("read backing file")),
            }
        }
        Ok(read)
    }

    /// fsync backing-файла.
    pub fn sync_file(&self, ft: FileType) -> Result<()> {
        if ft == FileType::Pos {
            return Ok(());
        }
        if ft == FileType::Wal {
            // fsync WAL — момент досканировать хвост на предмет коммитов
            return self.sync_wal();
        }
        let f = self.file(ft)?;
        f.sync_all().context("fsync backing file")?;
        Ok(())
    }

    /// Сбросить пул-дескриптор (после unlink файла).
    pub(crate) fn drop_pooled(&self, ft: FileType) {
        self.files.lock().unwrap().remove(&ft);
    }

    /// Инвалидация диапазона страничного кэша ядра (после удалённого
    /// применения). Ошибки логируются, но не фатальны: ядро перечитает.
    pub(crate) fn invalidate_range(&self, off: i64, len: i64) {
        let inv = self.invalidator.lock().unwrap().clone();
        if let Some(inv) = inv {
            if let Err(e) = inv.invalidate(self.id, off, len) {
                log::warn!("db {}: invalidate({}, {}): {:#}", self.id, off, len, e);
            } else {
                record_invalidation();
            }
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}
