//! db/snapshot — самодостаточные снапшоты состояния базы.
//!
//! write_snapshot_to стримит одну дельта-запись, воспроизводящую текущее
//! состояние с нуля: диапазон [1..=txid], pre=0, все страницы. Мьютекс
//! базы держится на всё время стрима — писатель не порвёт запись, а
//! снапшот соответствует некоторой реально достигнутой позиции.
//!
//! import заменяет состояние базы такой записью: файл базы
//! перезаписывается, журнал/WAL/shm сбрасываются, каталог лога заменяется
//! единственной записью-снапшотом.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;

use crate::db::core::{Db, FileType};
use crate::error::Error;
use crate::ltx::{dir as ltxdir, parse_header, LtxHeader, LtxReader, LtxWriter};
use crate::pos::Pos;
use crate::sqlite::{lock_page_number, WAL_FRAME_HDR_SIZE};
use crate::util::now_millis;

impl Db {
    /// Стримить снапшот текущего состояния в писатель. Возвращает позицию,
    /// которой соответствует снапшот.
    pub fn write_snapshot_to<W: Write>(&self, w: &mut W) -> Result<Pos> {
        let st = self.lock_state();
        if st.pos.txid == 0 {
            return Err(anyhow!(Error::Invalid).context("nothing to snapshot (txid=0)"));
        }
        let ps = st.page_size;
        let lock_pgno = lock_page_number(ps);

        let dbf = self.file_or_create(FileType::Database)?;
        let walf = if st.wal.hdr.is_some() {
            Some(self.file(FileType::Wal)?)
        } else {
            None
        };

        let hdr = LtxHeader {
            page_size: ps,
            commit: st.page_count,
            min_txid: 1,
            max_txid: st.pos.txid,
            pre_apply_checksum: 0,
            post_apply_checksum: st.pos.post_apply_checksum,
            timestamp: now_millis(),
        };
        let mut wtr = LtxWriter::new(w, &hdr)?;
        let mut buf = vec![0u8; ps as usize];
        for pgno in 1..=st.page_count {
            if pgno == lock_pgno {
                continue;
            }
            // текущие байты страницы: применённый кадр WAL, иначе файл базы
            match (walf.as_ref(), st.wal.page_frames.get(&pgno)) {
                (Some(walf), Some(&foff)) => walf
                    .read_exact_at(&mut buf, foff + WAL_FRAME_HDR_SIZE as u64)
                    .with_context(|| format!("snapshot read wal page {}", pgno))?,
                _ => dbf
                    .read_exact_at(&mut buf, (pgno as u64 - 1) * ps as u64)
                    .with_context(|| format!("snapshot read page {}", pgno))?,
            }
            wtr.write_frame(pgno, &buf)?;
        }
        wtr.finish()?;
        Ok(st.pos)
    }

    /// Заменить состояние базы снапшотом из читателя.
    pub fn import<R: Read>(&self, r: &mut R) -> Result<Pos> {
        let mut data = Vec::new();
        r.read_to_end(&mut data).context("read snapshot stream")?;

        let mut st = self.lock_state();

        let hdr = parse_header(&data)?;
        if hdr.min_txid != 1 || hdr.pre_apply_checksum != 0 {
            return Err(anyhow!(Error::Invalid).context("not a self-contained snapshot record"));
        }

        // Полная валидация (включая трейлер) до замены состояния.
        let mut rdr = LtxReader::new(&data[..], data.len() as u64)?;
        let mut frames: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut buf = Vec::new();
        while let Some(pgno) = rdr.next_frame(&mut buf)? {
            if pgno > hdr.commit {
                return Err(anyhow!(Error::Invalid)
                    .context(format!("frame page {} beyond commit size {}", pgno, hdr.commit)));
            }
            frames.insert(pgno, std::mem::take(&mut buf));
        }
        rdr.finish().context("verify snapshot record")?;

        // Замена файла базы.
        let ps = hdr.page_size as u64;
        let dbf = self.file_or_create(FileType::Database)?;
        dbf.set_len(0)?;
        for (pgno, page) in &frames {
            dbf.write_all_at(page, (*pgno as u64 - 1) * ps)
                .with_context(|| format!("import page {}", pgno))?;
        }
        dbf.set_len(hdr.commit as u64 * ps)?;
        dbf.sync_all()?;

        // Журнал/WAL/shm к новому состоянию не относятся.
        for ft in [FileType::Journal, FileType::Wal, FileType::Shm] {
            if let Some(name) = ft.storage_name() {
                let p = self.path().join(name);
                if p.exists() {
                    let _ = fs::remove_file(&p);
                }
            }
            self.drop_pooled(ft);
        }
        st.journal.reset();
        st.wal.reset();
        st.dirty = false;
        st.dirty_pages.clear();

        // Лог: единственная запись-снапшот.
        ltxdir::remove_all(&self.ltx_dir())?;
        ltxdir::publish(&self.ltx_dir(), hdr.min_txid, hdr.max_txid, |f| {
            f.write_all(&data).context("persist snapshot record")
        })?;

        st.page_size = hdr.page_size;
        st.page_count = hdr.commit;
        self.invalidate_range(0, -1);
        st.pos = Pos::new(hdr.max_txid, hdr.post_apply_checksum);
        Ok(st.pos)
    }
}
