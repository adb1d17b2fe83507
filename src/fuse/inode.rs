//! fuse/inode — кодеки имён, инодов и диапазонов блокировок поверхности.
//!
//! Плоский каталог: каждая база видна как до пяти файлов
//! <name>, <name>-journal, <name>-wal, <name>-shm, <name>-pos.
//! Инод файла = (db_id << 4) | тег типа; схема стабильна между
//! монтированиями, чтобы ядро могло переиспользовать кэшированные
//! хэндлы. Неизвестный тег — ошибка разбора, а не «какой-нибудь» тип.

use anyhow::{anyhow, Result};

use crate::db::{FileType, LockName};
use crate::error::Error;

/// Инод корневого каталога (фиксирован протоколом FUSE).
pub const ROOT_INO: u64 = 1;

/// Суффиксы видимых файлов.
pub const SUFFIX_JOURNAL: &str = "-journal";
pub const SUFFIX_WAL: &str = "-wal";
pub const SUFFIX_SHM: &str = "-shm";
pub const SUFFIX_POS: &str = "-pos";

/// Тег типа файла в младших 4 битах инода.
pub fn file_type_tag(ft: FileType) -> u64 {
    match ft {
        FileType::Database => 0,
        FileType::Journal => 1,
        FileType::Wal => 2,
        FileType::Shm => 3,
        FileType::Pos => 4,
    }
}

/// Обратный разбор тега. Схема допускает ≤16 типов; неизвестные теги
/// отвергаются на разборе.
pub fn file_type_from_tag(tag: u64) -> Result<FileType> {
    match tag {
        0 => Ok(FileType::Database),
        1 => Ok(FileType::Journal),
        2 => Ok(FileType::Wal),
        3 => Ok(FileType::Shm),
        4 => Ok(FileType::Pos),
        _ => Err(anyhow!(Error::Invalid).context(format!("unknown inode file tag {}", tag))),
    }
}

/// Инод файла базы.
#[inline]
pub fn db_ino(db_id: u32, ft: FileType) -> u64 {
    ((db_id as u64) << 4) | file_type_tag(ft)
}

/// Разбор инода на (id базы, тип файла).
pub fn parse_ino(ino: u64) -> Result<(u32, FileType)> {
    if ino < 1 << 4 {
        return Err(anyhow!(Error::Invalid).context(format!("inode {} out of range", ino)));
    }
    let db_id = ino >> 4;
    if db_id > u32::MAX as u64 {
        return Err(anyhow!(Error::Invalid).context(format!("inode {} out of range", ino)));
    }
    let ft = file_type_from_tag(ino & 0xF)?;
    Ok((db_id as u32, ft))
}

/// Разбор видимого имени на (имя базы, тип файла).
pub fn parse_filename(name: &str) -> (&str, FileType) {
    if let Some(base) = name.strip_suffix(SUFFIX_JOURNAL) {
        (base, FileType::Journal)
    } else if let Some(base) = name.strip_suffix(SUFFIX_WAL) {
        (base, FileType::Wal)
    } else if let Some(base) = name.strip_suffix(SUFFIX_SHM) {
        (base, FileType::Shm)
    } else if let Some(base) = name.strip_suffix(SUFFIX_POS) {
        (base, FileType::Pos)
    } else {
        (name, FileType::Database)
    }
}

/// Видимое имя файла по имени базы и типу.
pub fn filename(db_name: &str, ft: FileType) -> String {
    match ft {
        FileType::Database => db_name.to_string(),
        FileType::Journal => format!("{}{}", db_name, SUFFIX_JOURNAL),
        FileType::Wal => format!("{}{}", db_name, SUFFIX_WAL),
        FileType::Shm => format!("{}{}", db_name, SUFFIX_SHM),
        FileType::Pos => format!("{}{}", db_name, SUFFIX_POS),
    }
}

// -------- байтовые диапазоны блокировок движка --------

pub const LOCK_PENDING: u64 = 0x4000_0000;
pub const LOCK_RESERVED: u64 = 0x4000_0001;
pub const LOCK_SHARED_FIRST: u64 = 0x4000_0002;
pub const LOCK_SHARED_SIZE: u64 = 510;

/// Именованные блокировки, чьи байты попадают в диапазон [start, end].
pub fn lock_names_in_range(start: u64, end: u64) -> Vec<LockName> {
    let mut out = Vec::with_capacity(3);
    if start <= LOCK_PENDING && LOCK_PENDING <= end {
        out.push(LockName::Pending);
    }
    if start <= LOCK_RESERVED && LOCK_RESERVED <= end {
        out.push(LockName::Reserved);
    }
    let shared_last = LOCK_SHARED_FIRST + LOCK_SHARED_SIZE - 1;
    if start <= shared_last && end >= LOCK_SHARED_FIRST {
        out.push(LockName::Shared);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ino_roundtrip() {
        for ft in [
            FileType::Database,
            FileType::Journal,
            FileType::Wal,
            FileType::Shm,
            FileType::Pos,
        ] {
            let ino = db_ino(42, ft);
            assert_eq!(parse_ino(ino).unwrap(), (42, ft));
        }
    }

    #[test]
    fn ino_rejects_root_range_and_bad_tag() {
        assert!(parse_ino(0).is_err());
        assert!(parse_ino(ROOT_INO).is_err());
        assert!(parse_ino((1 << 4) | 0xF).is_err()); // неизвестный тег
    }

    #[test]
    fn filename_roundtrip() {
        for ft in [
            FileType::Database,
            FileType::Journal,
            FileType::Wal,
            FileType::Shm,
            FileType::Pos,
        ] {
            let name = filename("app.db", ft);
            assert_eq!(parse_filename(&name), ("app.db", ft));
        }
        assert_eq!(parse_filename("plain"), ("plain", FileType::Database));
    }

    #[test]
    fn lock_ranges() {
        use crate::db::LockName::*;
        // один байт PENDING
        assert_eq!(lock_names_in_range(LOCK_PENDING, LOCK_PENDING), vec![Pending]);
        // диапазон SHARED целиком
        assert_eq!(
            lock_names_in_range(LOCK_SHARED_FIRST, LOCK_SHARED_FIRST + LOCK_SHARED_SIZE - 1),
            vec![Shared]
        );
        // всё сразу
        assert_eq!(
            lock_names_in_range(LOCK_PENDING, LOCK_SHARED_FIRST + LOCK_SHARED_SIZE),
            vec![Pending, Reserved, Shared]
        );
        // вне зарезервированной области
        assert!(lock_names_in_range(0, 1024).is_empty());
    }
}
