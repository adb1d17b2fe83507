//! fuse — поверхность файловой системы (ядро ↔ Store).
//!
//! Разделение:
//! - inode.rs  — кодеки имён/инодов/диапазонов блокировок
//! - handle.rs — файловые и каталожные хэндлы
//! - mod.rs    — диспетчер запросов ядра (fuser::Filesystem) и монтирование
//!
//! Поверхность — один плоский каталог. Мутирующие операции требуют
//! primary-статуса (иначе EROFS). Каталоги, переименования, симлинки,
//! xattr и mknod намеренно отвергаются ENOSYS. Ошибки ядра мапятся из
//! sentinel-видов (error::errno_of).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, Session, TimeOrNow,
};

use crate::db::{Db, FileType, LockLevel};
use crate::error::errno_of;
use crate::metrics::record_lock_denial;
use crate::remote::Invalidator;
use crate::store::Store;

pub mod handle;
pub mod inode;

use handle::{DirHandle, FileHandle};
pub use inode::{db_ino, parse_filename, parse_ino, ROOT_INO};

/// TTL атрибутов для ядра.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Стартовый id хэндлов (не пересекается с «нулевыми» значениями ядра).
const FIRST_HANDLE_ID: u64 = 0xff00;

pub struct FileSystem {
    store: Arc<Store>,
    next_handle_id: u64,
    file_handles: HashMap<u64, FileHandle>,
    dir_handles: HashMap<u64, DirHandle>,
    uid: u32,
    gid: u32,
    debug: bool,
}

impl FileSystem {
    pub fn new(store: Arc<Store>) -> Self {
        let debug = store.config().fuse_debug;
        Self {
            store,
            next_handle_id: FIRST_HANDLE_ID,
            file_handles: HashMap::new(),
            dir_handles: HashMap::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            debug,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        id
    }

    fn new_file_handle(&mut self, db: Arc<Db>, ft: FileType) -> u64 {
        let id = self.next_id();
        self.file_handles.insert(id, FileHandle::new(id, db, ft));
        id
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FuseFileType::Directory,
            perm: 0o777,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn db_file_attr(&self, db: &Db, ft: FileType) -> Result<FileAttr> {
        let size = db.file_size(ft)?;
        Ok(FileAttr {
            ino: db_ino(db.id(), ft),
            size,
            blocks: (size + 511) / 512,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FuseFileType::RegularFile,
            perm: 0o666,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }

    /// Перечень видимых записей корня (для readdir), отсортирован по
    /// имени базы; внутри базы — фиксированный порядок типов.
    fn dir_entries(&self) -> Vec<(u64, String)> {
        let mut dbs = self.store.list_dbs();
        dbs.sort_by(|a, b| a.name().cmp(b.name()));

        let mut out = Vec::new();
        for db in dbs {
            for ft in [
                FileType::Database,
                FileType::Journal,
                FileType::Wal,
                FileType::Shm,
                FileType::Pos,
            ] {
                if db.file_exists(ft) {
                    out.push((db_ino(db.id(), ft), inode::filename(db.name(), ft)));
                }
            }
        }
        out
    }
}

fn level_from_typ(typ: i32) -> Option<LockLevel> {
    if typ == libc::F_RDLCK {
        Some(LockLevel::Read)
    } else if typ == libc::F_WRLCK {
        Some(LockLevel::Write)
    } else if typ == libc::F_UNLCK {
        Some(LockLevel::Unlocked)
    } else {
        None
    }
}

impl Filesystem for FileSystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            log::warn!("fuse: lookup(): invalid parent inode {}", parent);
            reply.error(libc::EINVAL);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let (db_name, ft) = parse_filename(name);
        let Some(db) = self.store.find_db_by_name(db_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !db.file_exists(ft) {
            reply.error(libc::ENOENT);
            return;
        }
        match self.db_file_attr(&db, ft) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 1),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&ATTR_TTL, &self.root_attr());
            return;
        }
        let (db_id, ft) = match parse_ino(ino) {
            Ok(v) => v,
            Err(_) => {
                log::debug!("fuse: getattr(): cannot parse inode {}", ino);
                reply.error(libc::ENOENT);
                return;
            }
        };
        let Some(db) = self.store.find_db(db_id) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !db.file_exists(ft) {
            reply.error(libc::ENOENT);
            return;
        }
        match self.db_file_attr(&db, ft) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let (db_id, ft) = match parse_ino(ino) {
            Ok(v) => v,
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        };
        let Some(db) = self.store.find_db(db_id) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(size) = size {
            if !self.store.is_primary() {
                reply.error(libc::EROFS);
                return;
            }
            if self.debug {
                log::debug!("fuse: setattr(): truncate {:?} to {}", ft, size);
            }
            let res = match ft {
                FileType::Database => db.truncate_database(size),
                FileType::Journal => db.truncate_journal(size),
                FileType::Wal => db.truncate_wal(size),
                FileType::Shm => db.truncate_shm(size),
                FileType::Pos => {
                    reply.error(libc::ENOSYS);
                    return;
                }
            };
            if let Err(e) = res {
                log::warn!("fuse: setattr(): truncate failed: {:#}", e);
                reply.error(errno_of(&e));
                return;
            }
        }
        // смена mode/uid/времён не поддерживается, но безвредна
        match self.db_file_attr(&db, ft) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let (db_id, ft) = match parse_ino(ino) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("fuse: open(): cannot parse inode {}", ino);
                reply.error(errno_of(&e));
                return;
            }
        };
        let Some(db) = self.store.find_db(db_id) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !db.file_exists(ft) {
            reply.error(libc::ENOENT);
            return;
        }
        let fh = self.new_file_handle(db, ft);
        reply.opened(fh, flags as u32);
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if parent != ROOT_INO {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        if !self.store.is_primary() {
            reply.error(libc::EROFS);
            return;
        }
        let (db_name, ft) = parse_filename(name);
        if self.debug {
            log::debug!("fuse: create(): {:?} type {:?}", db_name, ft);
        }

        let db = match ft {
            FileType::Database => match self.store.create_db(db_name) {
                Ok(db) => {
                    // backing-файл уже создан Store-ом
                    db
                }
                Err(e) => {
                    log::warn!("fuse: create(): cannot create database: {:#}", e);
                    reply.error(errno_of(&e));
                    return;
                }
            },
            FileType::Pos => {
                reply.error(libc::ENOSYS);
                return;
            }
            _ => {
                let Some(db) = self.store.find_db_by_name(db_name) else {
                    log::warn!("fuse: create(): database not found: {:?}", db_name);
                    reply.error(libc::ENOENT);
                    return;
                };
                let res = match ft {
                    FileType::Journal => db.create_journal(),
                    FileType::Wal => db.create_wal(),
                    FileType::Shm => db.create_shm(),
                    _ => unreachable!(),
                };
                if let Err(e) = res {
                    log::warn!("fuse: create(): {:#}", e);
                    reply.error(errno_of(&e));
                    return;
                }
                db
            }
        };

        match self.db_file_attr(&db, ft) {
            Ok(attr) => {
                let fh = self.new_file_handle(db, ft);
                reply.created(&ATTR_TTL, &attr, 1, fh, flags as u32);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.file_handles.get(&fh) else {
            log::warn!("fuse: read(): bad file handle {}", fh);
            reply.error(libc::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match handle
            .db()
            .read_file_at(handle.file_type(), &mut buf, offset as u64)
        {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                log::warn!("fuse: read(): {:#}", e);
                reply.error(errno_of(&e));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.file_handles.get(&fh) else {
            log::warn!("fuse: write(): bad file handle {}", fh);
            reply.error(libc::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        if !self.store.is_primary() {
            reply.error(libc::EROFS);
            return;
        }
        let db = handle.db().clone();
        let off = offset as u64;
        let res = match handle.file_type() {
            FileType::Database => db.write_database(data, off),
            FileType::Journal => db.write_journal(data, off),
            FileType::Wal => db.write_wal(data, off),
            FileType::Shm => db.write_shm(data, off),
            FileType::Pos => {
                reply.error(libc::ENOSYS);
                return;
            }
        };
        match res {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                log::warn!("fuse: write(): {:#}", e);
                reply.error(errno_of(&e));
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.file_handles.contains_key(&fh) {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(mut handle) = self.file_handles.remove(&fh) {
            handle.release_locks();
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.file_handles.get(&fh) else {
            log::warn!("fuse: fsync(): bad file handle {}", fh);
            reply.error(libc::EBADF);
            return;
        };
        let db = handle.db().clone();
        match db.sync_file(handle.file_type()) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log::warn!("fuse: fsync(): {:#}", e);
                reply.error(errno_of(&e));
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if parent != ROOT_INO {
            log::warn!("fuse: unlink(): invalid parent inode {}", parent);
            reply.error(libc::EINVAL);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let (db_name, ft) = parse_filename(name);
        match ft {
            FileType::Journal => {
                let Some(db) = self.store.find_db_by_name(db_name) else {
                    reply.error(libc::ENOENT);
                    return;
                };
                if !self.store.is_primary() {
                    reply.error(libc::EROFS);
                    return;
                }
                match db.unlink_journal() {
                    Ok(()) => reply.ok(),
                    Err(e) => {
                        log::warn!("fuse: unlink(): journal commit failed: {:#}", e);
                        reply.error(errno_of(&e));
                    }
                }
            }
            // база, wal, shm и pos не удаляются через поверхность
            _ => reply.error(libc::ENOSYS),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino != ROOT_INO {
            reply.error(libc::ENOTDIR);
            return;
        }
        let id = self.next_id();
        self.dir_handles.insert(id, DirHandle::new(id));
        reply.opened(id, flags as u32);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(libc::ENOTDIR);
            return;
        }
        if !self.dir_handles.contains_key(&fh) {
            log::warn!("fuse: readdir(): bad dir handle {}", fh);
            reply.error(libc::EBADF);
            return;
        }

        let mut entries: Vec<(u64, FuseFileType, String)> = vec![
            (ROOT_INO, FuseFileType::Directory, ".".to_string()),
            (ROOT_INO, FuseFileType::Directory, "..".to_string()),
        ];
        entries.extend(
            self.dir_entries()
                .into_iter()
                .map(|(ino, name)| (ino, FuseFileType::RegularFile, name)),
        );

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break; // буфер ядра полон
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let files = self.store.list_dbs().len() as u64 * 5;
        reply.statfs(1 << 20, 1 << 19, 1 << 19, files, 1 << 16, 4096, 255, 4096);
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let Some(handle) = self.file_handles.get(&fh) else {
            log::warn!("fuse: getlk(): bad file handle {}", fh);
            reply.error(libc::EBADF);
            return;
        };
        match handle.file_type() {
            FileType::Database => {
                let Some(to) = level_from_typ(typ) else {
                    reply.error(libc::EINVAL);
                    return;
                };
                let names = inode::lock_names_in_range(start, end);
                if handle.getlk(to, &names) {
                    reply.locked(start, end, libc::F_UNLCK, pid);
                } else {
                    // консервативно сообщаем о чужом write-локе: для
                    // движка этого достаточно
                    reply.locked(start, end, libc::F_WRLCK, pid);
                }
            }
            // shm-блокировки не делегируются таблице: единственный
            // писатель на узле гарантирован primary-статусом
            FileType::Shm => reply.locked(start, end, libc::F_UNLCK, pid),
            _ => reply.error(libc::ENOSYS),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        if sleep {
            // блокирующий вариант не поддерживается
            reply.error(libc::ENOSYS);
            return;
        }
        let Some(handle) = self.file_handles.get_mut(&fh) else {
            log::warn!("fuse: setlk(): bad file handle {}", fh);
            reply.error(libc::EBADF);
            return;
        };
        match handle.file_type() {
            FileType::Database => {
                let Some(to) = level_from_typ(typ) else {
                    reply.error(libc::EINVAL);
                    return;
                };
                let names = inode::lock_names_in_range(start, end);
                if handle.setlk(to, &names) {
                    reply.ok();
                } else {
                    record_lock_denial();
                    reply.error(libc::EAGAIN);
                }
            }
            FileType::Shm => reply.ok(),
            _ => reply.error(libc::ENOSYS),
        }
    }

    // --- намеренно отвергаемые операции ---

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOSYS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: fuser::ReplyXattr,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: fuser::ReplyXattr) {
        reply.error(libc::ENOSYS);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOSYS);
    }
}

// -------------------- монтирование и инвалидатор --------------------

/// Инвалидатор страничного кэша ядра поверх notify-канала FUSE.
struct KernelInvalidator {
    notifier: fuser::Notifier,
}

impl Invalidator for KernelInvalidator {
    fn invalidate(&self, db_id: u32, offset: i64, len: i64) -> Result<()> {
        let ino = db_ino(db_id, FileType::Database);
        self.notifier
            .inval_inode(ino, offset, len)
            .with_context(|| format!("inval_inode ino={} off={} len={}", ino, offset, len))
    }
}

/// Смонтированная поверхность. Drop размонтирует и снимает инвалидатор.
pub struct MountHandle {
    store: Arc<Store>,
    unmounter: Option<fuser::SessionUnmounter>,
    thread: Option<std::thread::JoinHandle<std::io::Result<()>>>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Явное размонтирование (иначе выполнится на Drop).
    pub fn unmount(mut self) -> Result<()> {
        self.unmount_inner()
    }

    fn unmount_inner(&mut self) -> Result<()> {
        self.store.set_invalidator(None);
        if let Some(mut u) = self.unmounter.take() {
            u.unmount().context("unmount fuse session")?;
        }
        if let Some(t) = self.thread.take() {
            match t.join() {
                Ok(res) => res.context("fuse session loop")?,
                Err(_) => log::error!("fuse: session thread panicked"),
            }
        }
        Ok(())
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Err(e) = self.unmount_inner() {
            log::warn!("fuse: unmount on drop failed: {:#}", e);
        }
    }
}

/// Смонтировать поверхность и подключить инвалидатор кэша ядра к Store.
pub fn mount(store: Arc<Store>, mountpoint: impl Into<PathBuf>) -> Result<MountHandle> {
    let mountpoint = mountpoint.into();
    let fs = FileSystem::new(store.clone());
    let options = [MountOption::FSName("quiverfs".to_string())];

    let mut session = Session::new(fs, &mountpoint, &options)
        .with_context(|| format!("mount quiverfs at {}", mountpoint.display()))?;
    let notifier = session.notifier();
    let unmounter = session.unmount_callable();
    let invalidator: Arc<dyn Invalidator> = Arc::new(KernelInvalidator { notifier });
    store.set_invalidator(Some(invalidator));

    let thread = std::thread::Builder::new()
        .name("qfs-fuse".into())
        .spawn(move || session.run())
        .context("spawn fuse session thread")?;

    log::info!("fuse: mounted at {}", mountpoint.display());
    Ok(MountHandle {
        store,
        unmounter: Some(unmounter),
        thread: Some(thread),
        mountpoint,
    })
}
