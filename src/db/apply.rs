//! db/apply — применение дельта-записи к файлу базы (путь реплики).
//!
//! Запись сперва декодируется и валидируется целиком (включая трейлер),
//! и только потом пишется в файл: повреждённая запись фатальна для себя,
//! но не должна успеть испортить базу. После применения запись дословно
//! сохраняется в собственный каталог лога (реплика несёт полную историю
//! и может сама отдавать снапшоты), позиция сдвигается, затронутые
//! диапазоны инвалидируются в страничном кэше ядра до того, как новая
//! позиция станет наблюдаемой.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::FileExt;

use crate::db::core::{Db, DbState, FileType};
use crate::error::Error;
use crate::ltx::{dir as ltxdir, LtxHeader, LtxReader};
use crate::metrics::record_remote_apply;
use crate::pos::Pos;

impl Db {
    /// Применить закодированную дельта-запись (байты файла .ltx).
    pub fn apply_ltx_bytes(&self, data: &[u8]) -> Result<LtxHeader> {
        let mut st = self.lock_state();
        self.apply_ltx_locked(&mut st, data)
    }

    pub(crate) fn apply_ltx_locked(&self, st: &mut DbState, data: &[u8]) -> Result<LtxHeader> {
        // Полная валидация до каких-либо записей на диск.
        let mut r = LtxReader::new(data, data.len() as u64)?;
        let hdr = *r.header();

        if st.page_size != 0 && hdr.page_size != st.page_size {
            return Err(anyhow!(Error::Invalid).context(format!(
                "record page size {} != database page size {}",
                hdr.page_size, st.page_size
            )));
        }
        if hdr.pre_apply_checksum != st.pos.post_apply_checksum {
            return Err(anyhow!(Error::Corrupt).context(format!(
                "position mismatch: record pre={:016x}, db post={:016x}",
                hdr.pre_apply_checksum, st.pos.post_apply_checksum
            )));
        }
        if hdr.min_txid != st.pos.txid + 1 {
            return Err(anyhow!(Error::Invalid).context(format!(
                "non-contiguous txid: record {}..{}, db at {}",
                hdr.min_txid, hdr.max_txid, st.pos.txid
            )));
        }

        let mut frames: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut buf = Vec::new();
        while let Some(pgno) = r.next_frame(&mut buf)? {
            if pgno > hdr.commit {
                return Err(anyhow!(Error::Invalid)
                    .context(format!("frame page {} beyond commit size {}", pgno, hdr.commit)));
            }
            frames.insert(pgno, std::mem::take(&mut buf));
        }
        r.finish().context("verify ltx record")?;

        // Применение к файлу базы.
        let ps = hdr.page_size as u64;
        let dbf = self.file_or_create(FileType::Database)?;
        for (pgno, page) in &frames {
            dbf.write_all_at(page, (*pgno as u64 - 1) * ps)
                .with_context(|| format!("apply page {}", pgno))?;
        }
        dbf.set_len(hdr.commit as u64 * ps)?;
        if self.data_fsync {
            dbf.sync_all()?;
        }

        // Реплика сохраняет запись в собственный лог дословно.
        ltxdir::publish(&self.ltx_dir(), hdr.min_txid, hdr.max_txid, |f| {
            f.write_all(data).context("persist applied record")
        })?;

        let size_changed = hdr.commit != st.page_count;
        if st.page_size == 0 {
            st.page_size = hdr.page_size;
        }
        // Удалённая транзакция переписала файл базы напрямую — локальный
        // наблюдатель WAL к этому состоянию больше не относится.
        st.wal.reset();
        st.journal.reset();
        st.dirty = false;
        st.dirty_pages.clear();
        st.page_count = hdr.commit;

        // Инвалидация до публикации новой позиции (мьютекс ещё наш).
        if size_changed {
            self.invalidate_range(0, -1);
        } else {
            for pgno in frames.keys() {
                self.invalidate_range((*pgno as i64 - 1) * ps as i64, ps as i64);
            }
        }
        st.pos = Pos::new(hdr.max_txid, hdr.post_apply_checksum);

        record_remote_apply(data.len() as u64);
        log::debug!(
            "db {}: applied remote txid={}..{} pages={} commit={}",
            self.id(),
            hdr.min_txid,
            hdr.max_txid,
            frames.len(),
            hdr.commit
        );
        Ok(hdr)
    }
}
