//! db/journal — наблюдатель rollback-журнала движка.
//!
//! Протокол движка: создать журнал → записать заголовок → pre-image каждой
//! изменяемой страницы → записи в файл базы → fsync журнала и базы →
//! unlink/truncate журнала (= коммит). Журнал, оставшийся после падения,
//! при открытии реплеится обратно (откат), дельта не эмитится.
//!
//! Наблюдатель не разбирает записи журнала на лету: множество затронутых
//! страниц копится по записям в файл базы (shadow), а pre-image'ы читаются
//! из журнала один раз в момент коммита — для rolling-чексуммы.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;

use crate::db::core::{Db, DbState, FileType, FILE_JOURNAL};
use crate::error::Error;
use crate::ltx::checksum::{self, page_checksum};
use crate::ltx::{dir as ltxdir, LtxHeader, LtxWriter};
use crate::metrics::{record_journal_rollback, record_txn_commit};
use crate::pos::Pos;
use crate::sqlite::{lock_page_number, parse_journal_header, read_journal_pre_images};
use crate::util::{fsync_dir, now_millis};

/// Состояние наблюдателя журнала.
#[derive(Debug, Default)]
pub(crate) struct JournalObserver {
    /// Движок начал журнальную транзакцию (файл создан или записан).
    pub open: bool,
    /// Страницы, записанные в файл базы за время открытой транзакции.
    pub shadow: BTreeSet<u32>,
}

impl JournalObserver {
    pub fn reset(&mut self) {
        self.open = false;
        self.shadow.clear();
    }
}

impl Db {
    /// Создание журнала поверхностью ФС: начало транзакции.
    pub fn create_journal(&self) -> Result<()> {
        let mut st = self.lock_state();
        let f = self.file_or_create(FileType::Journal)?;
        f.set_len(0)?;
        st.journal.open = true;
        st.journal.shadow.clear();
        Ok(())
    }

    /// Запись в журнал: pass-through + пометка открытой транзакции.
    /// Заголовок журнала даёт запасной источник размера страницы.
    pub fn write_journal(&self, data: &[u8], off: u64) -> Result<()> {
        let mut st = self.lock_state();
        let f = self.file_or_create(FileType::Journal)?;
        f.write_all_at(data, off).context("write journal")?;
        if !st.journal.open {
            st.journal.open = true;
            st.journal.shadow.clear();
        }
        if off == 0 {
            if let Some(h) = parse_journal_header(data) {
                if st.page_size == 0 {
                    st.page_size = h.page_size;
                }
            }
        }
        Ok(())
    }

    /// unlink журнала: коммит или откат, затем удаление файла.
    pub fn unlink_journal(&self) -> Result<()> {
        let mut st = self.lock_state();
        let commit_res = self.commit_journal_locked(&mut st);

        let path = self.path().join(FILE_JOURNAL);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            let _ = fsync_dir(&path);
        }
        self.drop_pooled(FileType::Journal);
        commit_res
    }

    /// Усечение журнала (journal_mode=TRUNCATE): до нуля — коммит.
    pub fn truncate_journal(&self, size: u64) -> Result<()> {
        if size == 0 {
            let mut st = self.lock_state();
            self.commit_journal_locked(&mut st)?;
        }
        let f = self.file_or_create(FileType::Journal)?;
        f.set_len(size).context("truncate journal")?;
        Ok(())
    }

    /// Детект коммита: вызывается на unlink/truncate-to-zero журнала.
    /// Если пост-состояние совпало с пред-состоянием (откат движка или
    /// транзакция без записей) — позиция не двигается и дельта не эмитится.
    pub(crate) fn commit_journal_locked(&self, st: &mut DbState) -> Result<()> {
        if !st.journal.open {
            return Ok(());
        }

        let jf = match self.file(FileType::Journal) {
            Ok(f) => f,
            Err(_) => {
                st.journal.reset();
                return Ok(());
            }
        };
        let jlen = jf.metadata()?.len();
        let Some((jhdr, pre_images)) = read_journal_pre_images(&jf, jlen)? else {
            // валидного заголовка нет — транзакция не началась
            st.journal.reset();
            return Ok(());
        };

        if st.page_size == 0 {
            st.page_size = jhdr.page_size;
        }
        let ps = st.page_size;
        if ps != jhdr.page_size {
            return Err(anyhow!(Error::Invalid).context(format!(
                "journal page size {} != database page size {}",
                jhdr.page_size, ps
            )));
        }
        let lock_pgno = lock_page_number(ps);

        let dbf = self.file_or_create(FileType::Database)?;
        let db_len = dbf.metadata()?.len();
        let commit = (db_len / ps as u64) as u32;
        let orig = jhdr.orig_page_count;

        // Затронутые страницы: наблюдавшиеся записи ∪ pre-image'ы журнала
        // ∪ страницы, записанные вне сессии (их кадры обязаны попасть в
        // запись, иначе лог не воспроизведёт состояние).
        let mut touched: BTreeSet<u32> = st.journal.shadow.clone();
        touched.extend(pre_images.keys().copied());
        touched.extend(st.dirty_pages.iter().copied());
        touched.remove(&0);
        touched.remove(&lock_pgno);

        if touched.is_empty() && commit == st.page_count && !st.dirty {
            // BEGIN IMMEDIATE; COMMIT без записей
            st.journal.reset();
            return Ok(());
        }

        // Rolling-чексумма возможна, только если для каждого убираемого
        // вклада есть pre-image; иначе полный пересчёт по файлу.
        let mut need_full = st.dirty || orig != st.page_count;
        if !need_full {
            for &pgno in &touched {
                if pgno <= orig && !pre_images.contains_key(&pgno) {
                    need_full = true;
                    break;
                }
            }
        }
        if !need_full && commit < orig {
            for pgno in commit + 1..=orig {
                if pgno != lock_pgno && !pre_images.contains_key(&pgno) {
                    need_full = true;
                    break;
                }
            }
        }

        // Текущие байты затронутых страниц (они же кадры дельты).
        let mut new_pages: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut buf = vec![0u8; ps as usize];
        for &pgno in &touched {
            if pgno <= commit {
                dbf.read_exact_at(&mut buf, (pgno as u64 - 1) * ps as u64)
                    .with_context(|| format!("read page {}", pgno))?;
                new_pages.insert(pgno, buf.clone());
            }
        }

        let post = if need_full {
            checksum::database_file_checksum(&dbf, ps, commit)?
        } else {
            let mut c = st.pos.post_apply_checksum;
            for &pgno in &touched {
                let old = if pgno <= orig {
                    pre_images.get(&pgno).map(|img| page_checksum(pgno, img))
                } else {
                    None
                };
                let new = new_pages.get(&pgno).map(|d| page_checksum(pgno, d));
                c = checksum::apply_page(c, old, new);
            }
            c
        };

        if post == st.pos.post_apply_checksum && commit == st.page_count {
            // откат движка (реплей pre-image'ов) или нулевое изменение
            st.journal.reset();
            st.dirty = false;
            return Ok(());
        }

        let txid = st.pos.txid + 1;
        let hdr = LtxHeader {
            page_size: ps,
            commit,
            min_txid: txid,
            max_txid: txid,
            pre_apply_checksum: st.pos.post_apply_checksum,
            post_apply_checksum: post,
            timestamp: now_millis(),
        };

        if self.data_fsync {
            dbf.sync_all()?;
        }
        let (_, size) = ltxdir::publish(&self.ltx_dir(), txid, txid, |f| {
            let mut w = LtxWriter::new(BufWriter::new(f), &hdr)?;
            for (pgno, data) in &new_pages {
                w.write_frame(*pgno, data)?;
            }
            let (mut bw, _) = w.finish()?;
            bw.flush()?;
            Ok(())
        })?;

        log::debug!(
            "db {}: journal commit txid={} pages={} commit={}",
            self.id(),
            txid,
            new_pages.len(),
            commit
        );
        st.pos = Pos::new(txid, post);
        st.page_count = commit;
        st.dirty = false;
        st.dirty_pages.clear();
        st.journal.reset();
        record_txn_commit(new_pages.len() as u64, size);
        Ok(())
    }

    /// Откат журнала, оставшегося от упавшей транзакции (путь открытия).
    /// Возвращает true, если откат был выполнен.
    pub(crate) fn rollback_journal_locked(&self, st: &mut DbState) -> Result<bool> {
        let jpath = self.path().join(FILE_JOURNAL);
        let jlen = match fs::metadata(&jpath) {
            Ok(md) => md.len(),
            Err(_) => return Ok(false),
        };
        if jlen == 0 {
            let _ = fs::remove_file(&jpath);
            return Ok(false);
        }

        let jf = self.file(FileType::Journal)?;
        let Some((jhdr, pre_images)) = read_journal_pre_images(&jf, jlen)? else {
            let _ = fs::remove_file(&jpath);
            self.drop_pooled(FileType::Journal);
            return Ok(false);
        };

        if st.page_size == 0 {
            st.page_size = jhdr.page_size;
        }
        let ps = st.page_size as u64;
        let dbf = self.file_or_create(FileType::Database)?;

        let mut replayed = 0usize;
        for (&pgno, img) in &pre_images {
            if pgno == 0 || pgno as u64 > jhdr.orig_page_count as u64 {
                continue;
            }
            dbf.write_all_at(img, (pgno as u64 - 1) * ps)
                .with_context(|| format!("rollback page {}", pgno))?;
            replayed += 1;
        }
        dbf.set_len(jhdr.orig_page_count as u64 * ps)?;
        dbf.sync_all()?;

        fs::remove_file(&jpath).with_context(|| format!("remove {}", jpath.display()))?;
        let _ = fsync_dir(&jpath);
        self.drop_pooled(FileType::Journal);
        st.journal.reset();
        record_journal_rollback();
        log::warn!(
            "db {}: rolled back interrupted journal ({} pages, {} orig pages)",
            self.id(),
            replayed,
            jhdr.orig_page_count
        );
        Ok(true)
    }
}
