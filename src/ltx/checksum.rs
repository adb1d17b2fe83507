//! ltx/checksum — по-страничные и rolling-чексуммы состояния базы.
//!
//! Схема:
//! - чексумма страницы = XXH64(seed=0, pgno_le || data) с принудительно
//!   взведённым битом 63 (ненулевой маркер «чексумма посчитана»);
//! - чексумма базы = бит 63 | XOR маскированных чексумм всех страниц,
//!   кроме lock-страницы движка;
//! - rolling-обновление: XOR убирает вклад старой страницы и добавляет
//!   вклад новой. Где pre-image недоступен — полный пересчёт по файлу.
//!
//! Нулевое значение (Pos::default) зарезервировано за пустой базой и
//! никогда не возникает как результат apply (бит 63 гарантирует это).

use anyhow::{Context, Result};
use std::fs::File;
use std::hash::Hasher;
use std::os::unix::fs::FileExt;
use twox_hash::XxHash64;

use crate::sqlite::lock_page_number;

/// Бит-маркер посчитанной чексуммы (страницы и базы целиком).
pub const CHECKSUM_FLAG: u64 = 1 << 63;

/// Чексумма одной страницы: XXH64(seed=0) по pgno (LE) и содержимому.
pub fn page_checksum(pgno: u32, data: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(&pgno.to_le_bytes());
    h.write(data);
    CHECKSUM_FLAG | (h.finish() & !CHECKSUM_FLAG)
}

/// Применить к rolling-чексумме базы удаление старого вклада страницы и
/// добавление нового (XOR самообратен, порядок не важен).
pub fn apply_page(db_checksum: u64, old: Option<u64>, new: Option<u64>) -> u64 {
    let mut m = db_checksum & !CHECKSUM_FLAG;
    if let Some(o) = old {
        m ^= o & !CHECKSUM_FLAG;
    }
    if let Some(n) = new {
        m ^= n & !CHECKSUM_FLAG;
    }
    CHECKSUM_FLAG | m
}

/// Полный пересчёт чексуммы базы чтением файла: страницы 1..=page_count,
/// lock-страница пропускается.
pub fn database_file_checksum(f: &File, page_size: u32, page_count: u32) -> Result<u64> {
    let lock_pgno = lock_page_number(page_size);
    let mut buf = vec![0u8; page_size as usize];
    let mut m = 0u64;
    for pgno in 1..=page_count {
        if pgno == lock_pgno {
            continue;
        }
        let off = (pgno as u64 - 1) * page_size as u64;
        f.read_exact_at(&mut buf, off)
            .with_context(|| format!("read page {} for checksum", pgno))?;
        m ^= page_checksum(pgno, &buf) & !CHECKSUM_FLAG;
    }
    Ok(CHECKSUM_FLAG | m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_checksum_flagged_and_stable() {
        let a = page_checksum(1, b"hello");
        let b = page_checksum(1, b"hello");
        assert_eq!(a, b);
        assert_ne!(a & CHECKSUM_FLAG, 0);
        assert_ne!(a, page_checksum(2, b"hello"));
        assert_ne!(a, page_checksum(1, b"hellO"));
    }

    #[test]
    fn apply_page_is_reversible() {
        let p1 = page_checksum(1, b"one");
        let p2 = page_checksum(2, b"two");
        let p2b = page_checksum(2, b"two'");

        let db0 = apply_page(0, None, Some(p1));
        let db1 = apply_page(db0, None, Some(p2));
        // замена второй страницы и откат обратно
        let db2 = apply_page(db1, Some(p2), Some(p2b));
        let db3 = apply_page(db2, Some(p2b), Some(p2));
        assert_eq!(db3, db1);
        // удаление обеих страниц возвращает «пустой» маскированный ноль + флаг
        let empty = apply_page(apply_page(db1, Some(p1), None), Some(p2), None);
        assert_eq!(empty, CHECKSUM_FLAG);
    }

    #[test]
    fn incremental_matches_full_rescan() {
        let dir = std::env::temp_dir().join(format!(
            "qfs-cksum-{}-{}",
            std::process::id(),
            crate::util::now_millis()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("database");
        let ps = 512u32;

        let page_a = vec![1u8; ps as usize];
        let page_b = vec![2u8; ps as usize];
        std::fs::write(&path, [page_a.clone(), page_b.clone()].concat()).unwrap();

        let f = File::open(&path).unwrap();
        let full = database_file_checksum(&f, ps, 2).unwrap();

        let inc = apply_page(
            apply_page(0, None, Some(page_checksum(1, &page_a))),
            None,
            Some(page_checksum(2, &page_b)),
        );
        assert_eq!(full, inc);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
