//! db/open — восстановление состояния базы при открытии Store.
//!
//! Порядок восстановления:
//! 1. позиция/размеры из каталога лога (его наличие авторитетно);
//! 2. откат журнала, оставшегося от упавшей транзакции;
//! 3. рестарт-синхронизация WAL (лог авторитетен, хвост WAL усекается);
//! 4. вне WAL — сверка размера файла базы и ремонт реплеем последней
//!    записи (усечённый на страницу файл восстанавливается добайтово).

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;

use crate::db::core::{Db, DbState, FileType};
use crate::db::wal::read_ltx_header;
use crate::error::Error;
use crate::ltx::{dir as ltxdir, LtxReader};
use crate::pos::Pos;
use crate::sqlite::{page_size_from_header, DB_HEADER_SIZE};

impl Db {
    /// Восстановить состояние после открытия (вызывается Store-ом один
    /// раз до публикации базы).
    pub(crate) fn recover(&self) -> Result<()> {
        let mut st = self.lock_state();

        // [1] Позиция из каталога лога.
        let infos = ltxdir::enumerate(&self.ltx_dir())?;
        ltxdir::validate_contiguity(&infos)
            .with_context(|| format!("ltx log of db {}", self.id()))?;
        if let Some(last) = infos.last() {
            let hdr = read_ltx_header(&last.path)?;
            if hdr.min_txid != last.min_txid || hdr.max_txid != last.max_txid {
                return Err(anyhow!(Error::Invalid).context(format!(
                    "ltx filename/header mismatch at {}",
                    last.path.display()
                )));
            }
            st.pos = Pos::new(hdr.max_txid, hdr.post_apply_checksum);
            st.page_count = hdr.commit;
            st.page_size = hdr.page_size;
        }

        // Размер страницы из заголовка базы, если лог пуст.
        if st.page_size == 0 {
            if let Ok(dbf) = self.file(FileType::Database) {
                let mut hdr = [0u8; DB_HEADER_SIZE];
                if dbf.metadata()?.len() >= DB_HEADER_SIZE as u64 {
                    dbf.read_exact_at(&mut hdr, 0)?;
                    if let Some(ps) = page_size_from_header(&hdr) {
                        st.page_size = ps;
                    }
                }
            }
        }

        // [2] Откат незавершённого журнала.
        self.rollback_journal_locked(&mut st)?;

        // [3] Синхронизация WAL с логом.
        let wal_backed = self.wal_restart_sync_locked(&mut st)?;

        // [4] Сверка размера файла базы (только вне WAL).
        if !wal_backed && st.pos.txid > 0 && st.page_size > 0 {
            let dbf = self.file_or_create(FileType::Database)?;
            let expected = st.page_count as u64 * st.page_size as u64;
            let len = dbf.metadata()?.len();
            if len != expected {
                log::warn!(
                    "db {}: database file is {} bytes, expected {}; replaying last record",
                    self.id(),
                    len,
                    expected
                );
                self.reapply_last_record_locked(&mut st)?;
            }
        }

        log::debug!(
            "db {} ({}) recovered at pos {} (pages={}, wal_backed={})",
            self.id(),
            self.name(),
            st.pos,
            st.page_count,
            wal_backed
        );
        Ok(())
    }

    /// Реплей последней записи лога в файл базы (ремонт после усечения).
    /// Позиция не меняется: запись уже отражена в ней.
    fn reapply_last_record_locked(&self, st: &mut DbState) -> Result<()> {
        let infos = ltxdir::enumerate(&self.ltx_dir())?;
        let Some(last) = infos.last() else {
            return Ok(());
        };
        let data = std::fs::read(&last.path)
            .with_context(|| format!("read {}", last.path.display()))?;
        let mut r = LtxReader::new(&data[..], data.len() as u64)?;
        let hdr = *r.header();

        let mut frames: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut buf = Vec::new();
        while let Some(pgno) = r.next_frame(&mut buf)? {
            frames.insert(pgno, std::mem::take(&mut buf));
        }
        r.finish()
            .with_context(|| format!("verify {}", last.path.display()))?;

        let ps = hdr.page_size as u64;
        let dbf = self.file_or_create(FileType::Database)?;
        for (pgno, page) in &frames {
            dbf.write_all_at(page, (*pgno as u64 - 1) * ps)
                .with_context(|| format!("replay page {}", pgno))?;
        }
        dbf.set_len(hdr.commit as u64 * ps)?;
        dbf.sync_all()?;

        st.page_count = hdr.commit;
        log::warn!(
            "db {}: replayed record {}..{} ({} pages)",
            self.id(),
            hdr.min_txid,
            hdr.max_txid,
            frames.len()
        );
        Ok(())
    }
}
