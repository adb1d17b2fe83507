//! db/wal — наблюдатель WAL движка.
//!
//! Наблюдатель не разбирает буферы записи: после каждой записи/fsync в
//! "-wal" хвост файла досканируется с последнего применённого смещения
//! (подход stateful-ридера: частичный или невалидный кадр — стоп без
//! ошибки, перечитаем в следующий раз). Кадр с ненулевым полем commit
//! закрывает транзакцию и эмитит одну дельта-запись.
//!
//! Рестарт-синхронизация (путь открытия): каталог лога авторитетен.
//! WAL сканируется от заголовка, rolling-чексумма считается на каждой
//! границе коммита; новейшая граница, чья чексумма совпала с последней
//! записью лога, становится applied-смещением, хвост за ней усекается.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;

use crate::db::core::{Db, DbState, FileType, FILE_WAL};
use crate::error::Error;
use crate::ltx::checksum::{self, page_checksum};
use crate::ltx::{dir as ltxdir, LtxHeader, LtxWriter};
use crate::metrics::record_txn_commit;
use crate::pos::Pos;
use crate::sqlite::{
    lock_page_number, parse_wal_frame_header, parse_wal_header, read_exact_at_or_eof,
    wal_checksum, WalHeader, WAL_FRAME_HDR_SIZE, WAL_HDR_SIZE,
};
use crate::util::now_millis;

/// Состояние наблюдателя WAL.
#[derive(Debug, Default)]
pub(crate) struct WalObserver {
    pub hdr: Option<WalHeader>,
    /// Смещение, по которое кадры обработаны и отражены в логе.
    pub applied_offset: u64,
    /// Кумулятивная пара контрольных сумм на applied_offset.
    pub cksum: (u32, u32),
    /// Последний применённый кадр каждой страницы (pgno → смещение кадра).
    pub page_frames: HashMap<u32, u64>,
}

impl WalObserver {
    pub fn reset(&mut self) {
        *self = WalObserver::default();
    }
}

impl Db {
    /// Создание "-wal" поверхностью ФС.
    pub fn create_wal(&self) -> Result<()> {
        let mut st = self.lock_state();
        let f = self.file_or_create(FileType::Wal)?;
        f.set_len(0)?;
        st.wal.reset();
        Ok(())
    }

    /// Запись в WAL: pass-through + инкрементальный скан хвоста.
    /// Запись по нулевому смещению — рестарт WAL после чекпойнта.
    pub fn write_wal(&self, data: &[u8], off: u64) -> Result<()> {
        let mut st = self.lock_state();
        let f = self.file_or_create(FileType::Wal)?;
        f.write_all_at(data, off).context("write wal")?;
        if off == 0 {
            st.wal.reset();
        }
        self.wal_scan_locked(&mut st)
    }

    /// fsync WAL + скан (момент, когда коммит движка гарантированно на диске).
    pub(crate) fn sync_wal(&self) -> Result<()> {
        let f = match self.file(FileType::Wal) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        f.sync_all().context("fsync wal")?;
        let mut st = self.lock_state();
        self.wal_scan_locked(&mut st)
    }

    /// Усечение WAL (setattr size). Усечение до нуля/внутрь заголовка
    /// сбрасывает наблюдателя; усечение внутрь применённой области
    /// перечитывает цепочку без повторной эмиссии (кадры до усечения уже
    /// отражены в логе).
    pub fn truncate_wal(&self, size: u64) -> Result<()> {
        let mut st = self.lock_state();
        let f = self.file_or_create(FileType::Wal)?;
        f.set_len(size).context("truncate wal")?;
        if size < WAL_HDR_SIZE as u64 {
            st.wal.reset();
            return Ok(());
        }
        if size < st.wal.applied_offset {
            self.rebuild_wal_chain_locked(&mut st)?;
        }
        self.wal_scan_locked(&mut st)
    }

    /// Перечитать цепочку кадров от заголовка, восстановив applied-смещение
    /// по последней границе коммита. Дельты не эмитятся.
    fn rebuild_wal_chain_locked(&self, st: &mut DbState) -> Result<()> {
        st.wal.reset();
        let f = match self.file(FileType::Wal) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let len = f.metadata()?.len();
        let mut hb = [0u8; WAL_HDR_SIZE];
        if !read_exact_at_or_eof(&f, &mut hb, 0, len)? {
            return Ok(());
        }
        let hdr = match parse_wal_header(&hb) {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };
        st.wal.hdr = Some(hdr);
        st.wal.applied_offset = WAL_HDR_SIZE as u64;
        st.wal.cksum = (hdr.cksum1, hdr.cksum2);

        let frame_size = (WAL_FRAME_HDR_SIZE + hdr.page_size as usize) as u64;
        let be = hdr.checksum_big_endian();
        let mut pos = st.wal.applied_offset;
        let mut cksum = st.wal.cksum;
        let mut tx_frames: BTreeMap<u32, u64> = BTreeMap::new();
        let mut fbuf = vec![0u8; frame_size as usize];
        loop {
            if !read_exact_at_or_eof(&f, &mut fbuf, pos, len)? {
                break;
            }
            let fh = parse_wal_frame_header(&fbuf);
            if fh.salt1 != hdr.salt1 || fh.salt2 != hdr.salt2 {
                break;
            }
            let (s1, s2) = wal_checksum(be, cksum.0, cksum.1, &fbuf[0..8]);
            let (s1, s2) = wal_checksum(be, s1, s2, &fbuf[WAL_FRAME_HDR_SIZE..]);
            if s1 != fh.cksum1 || s2 != fh.cksum2 {
                break;
            }
            tx_frames.insert(fh.pgno, pos);
            cksum = (s1, s2);
            pos += frame_size;
            if fh.commit != 0 {
                for (&pgno, &foff) in &tx_frames {
                    st.wal.page_frames.insert(pgno, foff);
                }
                tx_frames.clear();
                st.wal.applied_offset = pos;
                st.wal.cksum = cksum;
            }
        }
        Ok(())
    }

    /// Доскан хвоста WAL от applied-смещения. Валидные кадры копятся в
    /// текущую транзакцию; commit-кадр эмитит дельту. Частичный хвост,
    /// несовпадение соли или чексуммы — стоп без ошибки.
    pub(crate) fn wal_scan_locked(&self, st: &mut DbState) -> Result<()> {
        let f = match self.file(FileType::Wal) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let len = f.metadata()?.len();

        if st.wal.hdr.is_none() {
            let mut hb = [0u8; WAL_HDR_SIZE];
            if !read_exact_at_or_eof(&f, &mut hb, 0, len)? {
                return Ok(());
            }
            let hdr = match parse_wal_header(&hb) {
                Ok(h) => h,
                Err(_) => return Ok(()), // заголовок ещё дописывается
            };
            if st.page_size == 0 {
                st.page_size = hdr.page_size;
            }
            if st.page_size != hdr.page_size {
                return Err(anyhow!(Error::Invalid).context(format!(
                    "wal page size {} != database page size {}",
                    hdr.page_size, st.page_size
                )));
            }
            st.wal.hdr = Some(hdr);
            st.wal.applied_offset = WAL_HDR_SIZE as u64;
            st.wal.cksum = (hdr.cksum1, hdr.cksum2);
            st.wal.page_frames.clear();
        }
        let hdr = st.wal.hdr.expect("initialized above");
        let frame_size = (WAL_FRAME_HDR_SIZE + hdr.page_size as usize) as u64;
        let be = hdr.checksum_big_endian();

        let mut pos = st.wal.applied_offset;
        let mut cksum = st.wal.cksum;
        let mut tx_frames: BTreeMap<u32, u64> = BTreeMap::new();
        let mut fbuf = vec![0u8; frame_size as usize];

        loop {
            if !read_exact_at_or_eof(&f, &mut fbuf, pos, len)? {
                break;
            }
            let fh = parse_wal_frame_header(&fbuf);
            if fh.salt1 != hdr.salt1 || fh.salt2 != hdr.salt2 {
                break; // хвост предыдущего поколения WAL
            }
            let (s1, s2) = wal_checksum(be, cksum.0, cksum.1, &fbuf[0..8]);
            let (s1, s2) = wal_checksum(be, s1, s2, &fbuf[WAL_FRAME_HDR_SIZE..]);
            if s1 != fh.cksum1 || s2 != fh.cksum2 {
                break; // кадр ещё дописывается
            }
            tx_frames.insert(fh.pgno, pos);
            cksum = (s1, s2);
            pos += frame_size;

            if fh.commit != 0 {
                self.commit_wal_tx_locked(st, &f, &tx_frames, fh.commit, pos, cksum)?;
                tx_frames.clear();
            }
        }
        Ok(())
    }

    /// Закрыть WAL-транзакцию: эмитить дельту и сдвинуть applied-состояние.
    fn commit_wal_tx_locked(
        &self,
        st: &mut DbState,
        walf: &File,
        tx_frames: &BTreeMap<u32, u64>,
        commit: u32,
        end_offset: u64,
        cksum_at_end: (u32, u32),
    ) -> Result<()> {
        let ps = st.page_size;
        let lock_pgno = lock_page_number(ps);
        let dbf = self.file_or_create(FileType::Database)?;

        // Кадры транзакции: последний кадр страницы выигрывает (BTreeMap
        // уже хранит последний — вставка перезаписывает).
        let mut new_pages: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut buf = vec![0u8; ps as usize];
        for (&pgno, &foff) in tx_frames {
            if pgno == lock_pgno || pgno == 0 || pgno > commit {
                continue;
            }
            walf.read_exact_at(&mut buf, foff + WAL_FRAME_HDR_SIZE as u64)
                .with_context(|| format!("read wal frame for page {}", pgno))?;
            new_pages.insert(pgno, buf.clone());
        }
        // страницы, записанные вне сессии, тоже едут кадрами (из файла
        // базы: прямые записи легли именно туда)
        if st.dirty {
            for &pgno in &st.dirty_pages {
                if pgno == lock_pgno || pgno == 0 || pgno > commit || new_pages.contains_key(&pgno)
                {
                    continue;
                }
                dbf.read_exact_at(&mut buf, (pgno as u64 - 1) * ps as u64)
                    .with_context(|| format!("read dirty page {}", pgno))?;
                new_pages.insert(pgno, buf.clone());
            }
        }

        let post = if st.dirty {
            // состояние запятнано записями вне сессии — полное наложение
            self.wal_overlay_checksum(st, &dbf, walf, Some(tx_frames), commit)?
        } else {
            let mut c = st.pos.post_apply_checksum;
            for &pgno in tx_frames.keys() {
                if pgno == lock_pgno || pgno == 0 {
                    continue;
                }
                let old = if pgno <= st.page_count {
                    Some(page_checksum(
                        pgno,
                        &self.read_prev_page(st, &dbf, walf, pgno, ps)?,
                    ))
                } else {
                    None
                };
                let new = new_pages.get(&pgno).map(|d| page_checksum(pgno, d));
                c = checksum::apply_page(c, old, new);
            }
            // усечённые страницы без кадров в этой транзакции
            if commit < st.page_count {
                for pgno in commit + 1..=st.page_count {
                    if pgno == lock_pgno || tx_frames.contains_key(&pgno) {
                        continue;
                    }
                    let old = page_checksum(
                        pgno,
                        &self.read_prev_page(st, &dbf, walf, pgno, ps)?,
                    );
                    c = checksum::apply_page(c, Some(old), None);
                }
            }
            c
        };

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
            "db {}: wal commit txid={} pages={} commit={} end_offset={}",
            self.id(),
            txid,
            new_pages.len(),
            commit,
            end_offset
        );
        st.pos = Pos::new(txid, post);
        st.page_count = commit;
        st.dirty = false;
        st.dirty_pages.clear();
        st.wal.applied_offset = end_offset;
        st.wal.cksum = cksum_at_end;
        for (&pgno, &foff) in tx_frames {
            st.wal.page_frames.insert(pgno, foff);
        }
        record_txn_commit(new_pages.len() as u64, size);
        Ok(())
    }

    /// Байты страницы в состоянии «до текущей транзакции»: последний
    /// применённый кадр WAL, иначе файл базы.
    fn read_prev_page(
        &self,
        st: &DbState,
        dbf: &File,
        walf: &File,
        pgno: u32,
        ps: u32,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; ps as usize];
        if let Some(&foff) = st.wal.page_frames.get(&pgno) {
            walf.read_exact_at(&mut buf, foff + WAL_FRAME_HDR_SIZE as u64)
                .with_context(|| format!("read applied wal frame for page {}", pgno))?;
        } else {
            dbf.read_exact_at(&mut buf, (pgno as u64 - 1) * ps as u64)
                .with_context(|| format!("read page {} from database", pgno))?;
        }
        Ok(buf)
    }

    /// Полный пересчёт чексуммы состояния: файл базы, наложенный кадрами
    /// page_frames и (опционально) кадрами текущей транзакции.
    fn wal_overlay_checksum(
        &self,
        st: &DbState,
        dbf: &File,
        walf: &File,
        extra: Option<&BTreeMap<u32, u64>>,
        commit: u32,
    ) -> Result<u64> {
        let ps = st.page_size;
        let lock_pgno = lock_page_number(ps);
        let mut buf = vec![0u8; ps as usize];
        let mut m = 0u64;
        for pgno in 1..=commit {
            if pgno == lock_pgno {
                continue;
            }
            let frame_off = extra
                .and_then(|t| t.get(&pgno).copied())
                .or_else(|| st.wal.page_frames.get(&pgno).copied());
            match frame_off {
                Some(foff) => walf
                    .read_exact_at(&mut buf, foff + WAL_FRAME_HDR_SIZE as u64)
                    .with_context(|| format!("overlay read wal page {}", pgno))?,
                None => dbf
                    .read_exact_at(&mut buf, (pgno as u64 - 1) * ps as u64)
                    .with_context(|| format!("overlay read db page {}", pgno))?,
            }
            m ^= page_checksum(pgno, &buf) & !checksum::CHECKSUM_FLAG;
        }
        Ok(checksum::CHECKSUM_FLAG | m)
    }

    /// Рестарт-синхронизация WAL при открытии. Возвращает true, если WAL
    /// валиден и наблюдатель инициализирован (состояние базы накрыто WAL).
    pub(crate) fn wal_restart_sync_locked(&self, st: &mut DbState) -> Result<bool> {
        let wpath = self.path().join(FILE_WAL);
        let wlen = match fs::metadata(&wpath) {
            Ok(md) => md.len(),
            Err(_) => return Ok(false),
        };
        if wlen < WAL_HDR_SIZE as u64 {
            return Ok(false);
        }
        let walf = self.file(FileType::Wal)?;
        let mut hb = [0u8; WAL_HDR_SIZE];
        walf.read_exact_at(&mut hb, 0)?;
        let hdr = match parse_wal_header(&hb) {
            Ok(h) => h,
            Err(_) => {
                log::warn!("db {}: wal header invalid, ignoring wal", self.id());
                return Ok(false);
            }
        };
        if st.page_size == 0 {
            st.page_size = hdr.page_size;
        }
        if st.page_size != hdr.page_size {
            return Err(anyhow!(Error::Invalid).context("wal/database page size mismatch"));
        }
        let ps = st.page_size;
        let lock_pgno = lock_page_number(ps);
        let frame_size = (WAL_FRAME_HDR_SIZE + ps as usize) as u64;
        let be = hdr.checksum_big_endian();

        let dbf = self.file_or_create(FileType::Database)?;
        let db_len = dbf.metadata()?.len();
        let base_count = (db_len / ps as u64) as u32;
        let base_cksum = checksum::database_file_checksum(&dbf, ps, base_count)?;

        // Первый проход: границы коммитов с rolling-чексуммой состояния.
        struct Boundary {
            offset: u64,
            cksum_pair: (u32, u32),
            state: u64,
            page_count: u32,
        }
        let mut boundaries: Vec<Boundary> = vec![Boundary {
            offset: WAL_HDR_SIZE as u64,
            cksum_pair: (hdr.cksum1, hdr.cksum2),
            state: base_cksum,
            page_count: base_count,
        }];

        let mut overlay: HashMap<u32, u64> = HashMap::new();
        let mut tx_frames: BTreeMap<u32, u64> = BTreeMap::new();
        let mut pos = WAL_HDR_SIZE as u64;
        let mut cksum = (hdr.cksum1, hdr.cksum2);
        let mut state = base_cksum;
        let mut count = base_count;
        let mut fbuf = vec![0u8; frame_size as usize];
        let mut page = vec![0u8; ps as usize];

        loop {
            if !read_exact_at_or_eof(&walf, &mut fbuf, pos, wlen)? {
                break;
            }
            let fh = parse_wal_frame_header(&fbuf);
            if fh.salt1 != hdr.salt1 || fh.salt2 != hdr.salt2 {
                break;
            }
            let (s1, s2) = wal_checksum(be, cksum.0, cksum.1, &fbuf[0..8]);
            let (s1, s2) = wal_checksum(be, s1, s2, &fbuf[WAL_FRAME_HDR_SIZE..]);
            if s1 != fh.cksum1 || s2 != fh.cksum2 {
                break;
            }
            tx_frames.insert(fh.pgno, pos);
            cksum = (s1, s2);
            pos += frame_size;

            if fh.commit != 0 {
                let commit = fh.commit;
                for (&pgno, &foff) in &tx_frames {
                    if pgno == lock_pgno || pgno == 0 {
                        continue;
                    }
                    let old = if pgno <= count {
                        match overlay.get(&pgno) {
                            Some(&prev_off) => {
                                walf.read_exact_at(&mut page, prev_off + WAL_FRAME_HDR_SIZE as u64)?;
                                Some(page_checksum(pgno, &page))
                            }
                            None => {
                                dbf.read_exact_at(&mut page, (pgno as u64 - 1) * ps as u64)?;
                                Some(page_checksum(pgno, &page))
                            }
                        }
                    } else {
                        None
                    };
                    let new = if pgno <= commit {
                        walf.read_exact_at(&mut page, foff + WAL_FRAME_HDR_SIZE as u64)?;
                        Some(page_checksum(pgno, &page))
                    } else {
                        None
                    };
                    state = checksum::apply_page(state, old, new);
                }
                if commit < count {
                    for pgno in commit + 1..=count {
                        if pgno == lock_pgno || tx_frames.contains_key(&pgno) {
                            continue;
                        }
                        let old = match overlay.get(&pgno) {
                            Some(&prev_off) => {
                                walf.read_exact_at(&mut page, prev_off + WAL_FRAME_HDR_SIZE as u64)?;
                                page_checksum(pgno, &page)
                            }
                            None => {
                                dbf.read_exact_at(&mut page, (pgno as u64 - 1) * ps as u64)?;
                                page_checksum(pgno, &page)
                            }
                        };
                        state = checksum::apply_page(state, Some(old), None);
                    }
                }
                for (&pgno, &foff) in &tx_frames {
                    overlay.insert(pgno, foff);
                }
                tx_frames.clear();
                count = commit;
                boundaries.push(Boundary {
                    offset: pos,
                    cksum_pair: cksum,
                    state,
                    page_count: count,
                });
            }
        }

        // Целевая граница: сперва текущая позиция из лога, затем более
        // ранние записи (усечение лога назад).
        let target = st.pos.post_apply_checksum;
        let mut matched = boundaries
            .iter()
            .rev()
            .find(|b| (st.pos.is_zero() && b.offset == WAL_HDR_SIZE as u64) || b.state == target);

        if matched.is_none() {
            let infos = ltxdir::enumerate(&self.ltx_dir())?;
            'outer: for info in infos.iter().rev() {
                let rec_hdr = read_ltx_header(&info.path)?;
                for b in boundaries.iter().rev() {
                    if b.state == rec_hdr.post_apply_checksum {
                        let removed = ltxdir::truncate_after(&self.ltx_dir(), rec_hdr.max_txid)?;
                        log::warn!(
                            "db {}: log out of sync with wal, dropped {} record(s), pos now {}",
                            self.id(),
                            removed,
                            rec_hdr.max_txid
                        );
                        st.pos = Pos::new(rec_hdr.max_txid, rec_hdr.post_apply_checksum);
                        st.page_count = rec_hdr.commit;
                        matched = Some(b);
                        break 'outer;
                    }
                }
            }
        }

        let Some(b) = matched else {
            log::warn!("db {}: wal does not match any log state, resetting wal", self.id());
            walf.set_len(0)?;
            walf.sync_all()?;
            self.drop_pooled(FileType::Wal);
            return Ok(false);
        };

        // Усечь хвост за выбранной границей: кадры там не дали durable
        // записи и считаются незакоммиченными.
        if wlen > b.offset {
            let dropped = (wlen - b.offset) / frame_size;
            log::warn!(
                "db {}: truncating {} unrecorded wal frame(s) past offset {}",
                self.id(),
                dropped,
                b.offset
            );
            walf.set_len(b.offset)?;
            walf.sync_all()?;
        }

        // Второй проход: восстановить page_frames до выбранной границы.
        st.wal.hdr = Some(hdr);
        st.wal.applied_offset = b.offset;
        st.wal.cksum = b.cksum_pair;
        st.wal.page_frames.clear();
        let end = b.offset;
        let mut fpos = WAL_HDR_SIZE as u64;
        let mut fh_buf = [0u8; WAL_FRAME_HDR_SIZE];
        while fpos + frame_size <= end {
            walf.read_exact_at(&mut fh_buf, fpos)?;
            let fh = parse_wal_frame_header(&fh_buf);
            st.wal.page_frames.insert(fh.pgno, fpos);
            fpos += frame_size;
        }
        if st.page_count != b.page_count {
            log::warn!(
                "db {}: page count {} adjusted to wal boundary {}",
                self.id(),
                st.page_count,
                b.page_count
            );
            st.page_count = b.page_count;
        }
        Ok(true)
    }
}

/// Прочитать только заголовок записи лога (без кадров).
pub(crate) fn read_ltx_header(path: &std::path::Path) -> Result<LtxHeader> {
    use std::io::Read;
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = [0u8; crate::ltx::LTX_HDR_SIZE];
    f.read_exact(&mut buf)?;
    crate::ltx::parse_header(&buf)
}
