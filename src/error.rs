//! Типизированные error-kinds поверх anyhow.
//!
//! Политика (как в остальном коде): весь plumbing идёт через anyhow::Result
//! с .with_context(...), а в местах, где вид ошибки является частью
//! контракта (FUSE errno, ReadOnly-гейт, Busy при конфликте блокировок),
//! в цепочку вкладывается sentinel `Error`. FUSE-слой достаёт его обратно
//! через downcast и мапит в errno.

use std::fmt;

/// Sentinel-вид ошибки. Вкладывается в anyhow::Error как источник.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Неизвестная база / отсутствующий файл.
    NotFound,
    /// База с таким именем уже создана.
    Exists,
    /// Некорректный inode, имя файла или запись лога.
    Invalid,
    /// Ошибка чтения/записи backing-файлов.
    Io,
    /// Запись на не-primary узле.
    ReadOnly,
    /// Потерян lease / узел не является primary.
    LeaseExpired,
    /// Несовпадение контрольной суммы при декодировании.
    Corrupt,
    /// Блокировка не может быть взята без ожидания.
    Busy,
    /// Запрос отменён ядром.
    Interrupted,
    /// Операция намеренно не поддерживается поверхностью ФС.
    Unsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::NotFound => "not found",
            Error::Exists => "already exists",
            Error::Invalid => "invalid argument",
            Error::Io => "i/o error",
            Error::ReadOnly => "read-only (not primary)",
            Error::LeaseExpired => "lease expired",
            Error::Corrupt => "checksum mismatch",
            Error::Busy => "resource busy",
            Error::Interrupted => "interrupted",
            Error::Unsupported => "operation not supported",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

/// Достать sentinel из цепочки anyhow (если есть).
pub fn kind_of(err: &anyhow::Error) -> Option<Error> {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            return Some(*e);
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::NotFound {
                return Some(Error::NotFound);
            }
            return Some(Error::Io);
        }
    }
    None
}

/// Маппинг sentinel → errno для FUSE-ответов. Неизвестное — EIO.
pub fn errno_of(err: &anyhow::Error) -> i32 {
    match kind_of(err) {
        Some(Error::NotFound) => libc::ENOENT,
        Some(Error::Exists) => libc::EEXIST,
        Some(Error::Invalid) => libc::EINVAL,
        Some(Error::Busy) => libc::EAGAIN,
        Some(Error::Unsupported) => libc::ENOSYS,
        Some(Error::ReadOnly) | Some(Error::LeaseExpired) => libc::EROFS,
        Some(Error::Interrupted) => libc::EINTR,
        Some(Error::Io) | Some(Error::Corrupt) | None => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context_chain() {
        let err = anyhow::Error::from(Error::Busy)
            .context("setlk db=1")
            .context("fuse: setlk()");
        assert_eq!(kind_of(&err), Some(Error::Busy));
        assert_eq!(errno_of(&err), libc::EAGAIN);
    }

    #[test]
    fn io_not_found_maps_to_enoent() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = anyhow::Error::from(io).context("open database");
        assert_eq!(errno_of(&err), libc::ENOENT);
    }

    #[test]
    fn unknown_error_maps_to_eio() {
        let err = anyhow::anyhow!("something else entirely");
        assert_eq!(kind_of(&err), None);
        assert_eq!(errno_of(&err), libc::EIO);
    }
}
