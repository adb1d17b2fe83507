//! ltx/dir — каталог лога транзакций на диске.
//!
//! Файлы именуются "<min:016x>-<max:016x>.ltx" и публикуются атомарно:
//! tmp-файл → fsync → rename → fsync каталога. Перечисление сортирует по
//! min_txid и проверяет инварианты: диапазоны не пересекаются, дыр нет,
//! наименьший min_txid ≤ 1 (или каталог пуст).
//!
//! Компактация склеивает непрерывный префикс в одну запись: состояние
//! после применения сохраняется, промежуточная история теряется.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::metrics::record_log_compaction;
use crate::util::{fsync_dir, now_millis};

use super::{LtxHeader, LtxReader, LtxWriter, LTX_EXT};

/// Описание одного файла записи в каталоге.
#[derive(Debug, Clone)]
pub struct LtxFileInfo {
    pub min_txid: u64,
    pub max_txid: u64,
    pub size: u64,
    pub path: PathBuf,
}

/// Имя файла записи по диапазону.
pub fn ltx_filename(min_txid: u64, max_txid: u64) -> String {
    format!("{:016x}-{:016x}.{}", min_txid, max_txid, LTX_EXT)
}

/// Разбор имени файла. None — не запись лога (tmp-файлы и прочее).
pub fn parse_ltx_filename(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(&format!(".{}", LTX_EXT))?;
    if stem.len() != 33 {
        return None;
    }
    let (min_s, rest) = stem.split_at(16);
    let max_s = rest.strip_prefix('-')?;
    let min = u64::from_str_radix(min_s, 16).ok()?;
    let max = u64::from_str_radix(max_s, 16).ok()?;
    Some((min, max))
}

/// Перечислить записи каталога, отсортированные по min_txid.
/// Отсутствующий каталог эквивалентен пустому.
pub fn enumerate(dir: &Path) -> Result<Vec<LtxFileInfo>> {
    let mut out = Vec::new();
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(anyhow!(e).context(format!("read ltx dir {}", dir.display()))),
    };
    for ent in rd {
        let ent = ent?;
        let name = ent.file_name();
        let name = name.to_string_lossy();
        let Some((min, max)) = parse_ltx_filename(&name) else {
            continue; // tmp-файлы незавершённых публикаций игнорируются
        };
        if min == 0 || min > max {
            return Err(anyhow!(Error::Invalid)
                .context(format!("bad ltx range in filename {}", name)));
        }
        out.push(LtxFileInfo {
            min_txid: min,
            max_txid: max,
            size: ent.metadata()?.len(),
            path: ent.path(),
        });
    }
    out.sort_by_key(|i| i.min_txid);
    Ok(out)
}

/// Проверить непрерывность диапазонов (после сортировки по min_txid).
pub fn validate_contiguity(infos: &[LtxFileInfo]) -> Result<()> {
    let Some(first) = infos.first() else {
        return Ok(());
    };
    if first.min_txid > 1 {
        return Err(anyhow!(Error::Invalid)
            .context(format!("ltx log starts at txid {} (> 1)", first.min_txid)));
    }
    for pair in infos.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.min_txid != a.max_txid + 1 {
            return Err(anyhow!(Error::Invalid).context(format!(
                "ltx log gap/overlap: {:016x}-{:016x} then {:016x}-{:016x}",
                a.min_txid, a.max_txid, b.min_txid, b.max_txid
            )));
        }
    }
    Ok(())
}

/// Атомарно опубликовать запись: fill пишет содержимое во временный файл,
/// затем fsync + rename + fsync каталога. Возвращает путь и размер.
pub fn publish<F>(dir: &Path, min_txid: u64, max_txid: u64, fill: F) -> Result<(PathBuf, u64)>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    fs::create_dir_all(dir).with_context(|| format!("create ltx dir {}", dir.display()))?;

    let name = ltx_filename(min_txid, max_txid);
    let path = dir.join(&name);
    let tmp = dir.join(format!("{}.tmp", name));
    let _ = fs::remove_file(&tmp); // best-effort

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .with_context(|| format!("open ltx tmp {}", tmp.display()))?;
    fill(&mut f)?;
    f.sync_all()?;
    let size = f.metadata()?.len();
    drop(f);

    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    let _ = fsync_dir(&path);
    Ok((path, size))
}

/// Удалить записи с max_txid > txid (усечение хвоста при рассинхроне WAL).
/// Возвращает количество удалённых файлов.
pub fn truncate_after(dir: &Path, txid: u64) -> Result<usize> {
    let infos = enumerate(dir)?;
    let mut removed = 0usize;
    for info in infos.iter().filter(|i| i.max_txid > txid) {
        if info.min_txid <= txid {
            // Склеенная запись, пересекающая границу, неделима.
            return Err(anyhow!(Error::Invalid).context(format!(
                "cannot truncate inside compacted record {:016x}-{:016x}",
                info.min_txid, info.max_txid
            )));
        }
        fs::remove_file(&info.path)
            .with_context(|| format!("remove {}", info.path.display()))?;
        removed += 1;
    }
    if removed > 0 {
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(removed)
}

/// Удалить все записи (замена состояния при import).
pub fn remove_all(dir: &Path) -> Result<()> {
    for info in enumerate(dir)? {
        fs::remove_file(&info.path)
            .with_context(|| format!("remove {}", info.path.display()))?;
    }
    Ok(())
}

/// Компактация: склеить первые (len - keep_last) записей в одну, если их
/// не меньше двух. Возвращает true, если склейка была выполнена.
pub fn compact(dir: &Path, keep_last: usize) -> Result<bool> {
    let infos = enumerate(dir)?;
    validate_contiguity(&infos)?;
    if infos.len() <= keep_last {
        return Ok(false);
    }
    let merge_n = infos.len() - keep_last;
    if merge_n < 2 {
        return Ok(false);
    }
    let prefix = &infos[..merge_n];

    // Применяем записи по порядку: поздний кадр выигрывает, уменьшение
    // commit усекает страницы за новым размером.
    let mut pages: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut first_hdr: Option<LtxHeader> = None;
    let mut last_hdr: Option<LtxHeader> = None;

    for info in prefix {
        let f = File::open(&info.path)
            .with_context(|| format!("open {}", info.path.display()))?;
        let mut r = LtxReader::new(BufReader::new(f), info.size)?;
        let hdr = *r.header();
        if hdr.min_txid != info.min_txid || hdr.max_txid != info.max_txid {
            return Err(anyhow!(Error::Invalid).context(format!(
                "ltx filename/header mismatch at {}",
                info.path.display()
            )));
        }
        if let Some(prev) = &last_hdr {
            if prev.page_size != hdr.page_size {
                return Err(anyhow!(Error::Invalid).context("page size changed mid-log"));
            }
            if prev.post_apply_checksum != hdr.pre_apply_checksum {
                return Err(anyhow!(Error::Corrupt).context(format!(
                    "checksum chain broken at txid {}",
                    hdr.min_txid
                )));
            }
        }

        let mut buf = Vec::new();
        while let Some(pgno) = r.next_frame(&mut buf)? {
            pages.insert(pgno, std::mem::take(&mut buf));
        }
        r.finish()
            .with_context(|| format!("verify {}", info.path.display()))?;

        pages.retain(|&pgno, _| pgno <= hdr.commit);
        if first_hdr.is_none() {
            first_hdr = Some(hdr);
        }
        last_hdr = Some(hdr);
    }

    let first = first_hdr.expect("merge_n >= 2");
    let last = last_hdr.expect("merge_n >= 2");
    let merged = LtxHeader {
        page_size: last.page_size,
        commit: last.commit,
        min_txid: first.min_txid,
        max_txid: last.max_txid,
        pre_apply_checksum: first.pre_apply_checksum,
        post_apply_checksum: last.post_apply_checksum,
        timestamp: now_millis(),
    };

    publish(dir, merged.min_txid, merged.max_txid, |f| {
        let mut w = LtxWriter::new(f, &merged)?;
        for (pgno, data) in &pages {
            w.write_frame(*pgno, data)?;
        }
        w.finish()?;
        Ok(())
    })?;

    for info in prefix {
        fs::remove_file(&info.path)
            .with_context(|| format!("remove {}", info.path.display()))?;
    }
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    record_log_compaction();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_roundtrip() {
        let name = ltx_filename(1, 0xff);
        assert_eq!(name, "0000000000000001-00000000000000ff.ltx");
        assert_eq!(parse_ltx_filename(&name), Some((1, 0xff)));
        assert_eq!(parse_ltx_filename("junk.ltx"), None);
        assert_eq!(parse_ltx_filename("0000000000000001-00000000000000ff.ltx.tmp"), None);
    }

    #[test]
    fn contiguity_validation() {
        let mk = |min, max| LtxFileInfo {
            min_txid: min,
            max_txid: max,
            size: 0,
            path: PathBuf::new(),
        };
        assert!(validate_contiguity(&[]).is_ok());
        assert!(validate_contiguity(&[mk(1, 3), mk(4, 4), mk(5, 9)]).is_ok());
        assert!(validate_contiguity(&[mk(2, 3)]).is_err()); // стартует не с 1
        assert!(validate_contiguity(&[mk(1, 3), mk(5, 6)]).is_err()); // дыра
        assert!(validate_contiguity(&[mk(1, 3), mk(3, 4)]).is_err()); // пересечение
    }
}
