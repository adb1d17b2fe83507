//! util — общие утилиты (время, fsync каталога, hex-идентификаторы).

use std::path::Path;

/// Текущее Unix-время в миллисекундах (u64, saturating).
#[inline]
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis().min(u64::MAX as u128) as u64
}

/// fsync родительского каталога (публикация rename). Best-effort вне unix.
#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = std::fs::File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Разбор hex8-имени каталога базы ("0000002a" -> 42).
pub fn parse_hex8(name: &str) -> Option<u32> {
    if name.len() != 8 {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

/// hex8-имя каталога базы по id.
#[inline]
pub fn format_hex8(id: u32) -> String {
    format!("{:08x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex8_roundtrip() {
        assert_eq!(parse_hex8(&format_hex8(1)), Some(1));
        assert_eq!(parse_hex8(&format_hex8(0xdead_beef)), Some(0xdead_beef));
        assert_eq!(parse_hex8("xyz"), None);
        assert_eq!(parse_hex8("123"), None);
    }

    #[test]
    fn now_millis_nonzero() {
        assert!(now_millis() > 0);
    }
}
