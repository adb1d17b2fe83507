//! sqlite — знание бинарных форматов движка (database header, rollback
//! journal, WAL). Только разбор и контрольные суммы; интерпретация событий
//! живёт в db/journal.rs и db/wal.rs.
//!
//! Все поля форматов движка — big-endian (в отличие от наших собственных
//! форматов, которые little-endian).

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;

use crate::error::Error;

// -------- Database file header --------

pub const DB_HEADER_SIZE: usize = 100;
pub const DB_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Байт PENDING-блокировки; страница, содержащая это смещение,
/// зарезервирована движком и никогда не попадает в дельта-записи.
pub const PENDING_BYTE: u64 = 0x4000_0000;

/// Номер lock-страницы для данного размера страницы (1-based).
#[inline]
pub fn lock_page_number(page_size: u32) -> u32 {
    (PENDING_BYTE / page_size as u64) as u32 + 1
}

/// Проверка размера страницы движка (2^n, 512..=65536).
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if page_size < 512 || page_size > 65536 || (page_size & (page_size - 1)) != 0 {
        return Err(anyhow!(Error::Invalid)
            .context(format!("page size must be a power of two in [512..65536], got {}", page_size)));
    }
    Ok(())
}

/// Размер страницы из заголовка базы (offset 16, u16 BE; 1 означает 65536).
/// None — заголовок ещё не записан или не похож на базу движка.
pub fn page_size_from_header(hdr: &[u8]) -> Option<u32> {
    if hdr.len() < DB_HEADER_SIZE || &hdr[0..16] != DB_MAGIC {
        return None;
    }
    let raw = BigEndian::read_u16(&hdr[16..18]);
    let ps = if raw == 1 { 65536 } else { raw as u32 };
    validate_page_size(ps).ok().map(|_| ps)
}

/// Счётчик страниц из заголовка базы (offset 28, u32 BE).
pub fn page_count_from_header(hdr: &[u8]) -> Option<u32> {
    if hdr.len() < DB_HEADER_SIZE || &hdr[0..16] != DB_MAGIC {
        return None;
    }
    Some(BigEndian::read_u32(&hdr[28..32]))
}

// -------- Rollback journal --------

pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];
pub const JOURNAL_HDR_SIZE: usize = 28; // magic8 + nRec + nonce + origPages + sectorSize + pageSize

/// Заголовок сегмента журнала. Сегментов может быть несколько
/// (cache spill пишет новый заголовок на границе сектора).
#[derive(Debug, Clone, Copy)]
pub struct JournalSegmentHeader {
    /// Количество записей в сегменте; 0xffffffff — «читать до конца».
    pub rec_count: u32,
    /// Стартовое значение контрольной суммы записей.
    pub cksum_nonce: u32,
    /// Размер базы (в страницах) до начала транзакции.
    pub orig_page_count: u32,
    /// Размер сектора, которым выровнен заголовок.
    pub sector_size: u32,
    /// Размер страницы на момент записи журнала.
    pub page_size: u32,
}

pub const JOURNAL_REC_COUNT_TO_EOF: u32 = 0xffff_ffff;

/// Разобрать заголовок сегмента по буферу. None — не заголовок
/// (обнулённый журнал или мусор), что трактуется как конец журнала.
pub fn parse_journal_header(buf: &[u8]) -> Option<JournalSegmentHeader> {
    if buf.len() < JOURNAL_HDR_SIZE || buf[0..8] != JOURNAL_MAGIC {
        return None;
    }
    let h = JournalSegmentHeader {
        rec_count: BigEndian::read_u32(&buf[8..12]),
        cksum_nonce: BigEndian::read_u32(&buf[12..16]),
        orig_page_count: BigEndian::read_u32(&buf[16..20]),
        sector_size: BigEndian::read_u32(&buf[20..24]),
        page_size: BigEndian::read_u32(&buf[24..28]),
    };
    if h.sector_size < 32 || (h.sector_size & (h.sector_size - 1)) != 0 {
        return None;
    }
    if validate_page_size(h.page_size).is_err() {
        return None;
    }
    Some(h)
}

/// Контрольная сумма записи журнала: nonce + каждый 200-й байт данных
/// (начиная с конца), как в движке.
pub fn journal_record_checksum(nonce: u32, data: &[u8]) -> u32 {
    let mut cksum = nonce;
    let mut i = data.len() as i64 - 200;
    while i > 0 {
        cksum = cksum.wrapping_add(data[i as usize] as u32);
        i -= 200;
    }
    cksum
}

/// Прочитать pre-image'ы из журнала: (заголовок первого сегмента,
/// pgno -> оригинальные байты). Для каждой страницы берётся первый
/// встретившийся pre-image. Частичный/повреждённый хвост обрывает чтение
/// без ошибки (движок пишет журнал с fsync-барьерами, хвост не доверен).
pub fn read_journal_pre_images(
    f: &File,
    file_len: u64,
) -> Result<Option<(JournalSegmentHeader, BTreeMap<u32, Vec<u8>>)>> {
    let mut hdr_buf = [0u8; JOURNAL_HDR_SIZE];
    if file_len < JOURNAL_HDR_SIZE as u64 {
        return Ok(None);
    }
    f.read_exact_at(&mut hdr_buf, 0)?;
    let first = match parse_journal_header(&hdr_buf) {
        Some(h) => h,
        None => return Ok(None),
    };

    let ps = first.page_size as usize;
    let rec_size = 4 + ps as u64 + 4;
    let mut images: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

    let mut seg = first;
    let mut pos = seg.sector_size as u64; // записи идут после заголовка, выровненного на сектор
    'segments: loop {
        let mut remaining = seg.rec_count;
        loop {
            if remaining != JOURNAL_REC_COUNT_TO_EOF && remaining == 0 {
                break;
            }
            if pos + rec_size > file_len {
                break 'segments; // частичный хвост
            }
            let mut rec = vec![0u8; rec_size as usize];
            f.read_exact_at(&mut rec, pos)?;
            let pgno = BigEndian::read_u32(&rec[0..4]);
            if pgno == 0 {
                break 'segments;
            }
            let data = &rec[4..4 + ps];
            let stored = BigEndian::read_u32(&rec[4 + ps..]);
            if stored != journal_record_checksum(seg.cksum_nonce, data) {
                break 'segments; // torn record
            }
            images.entry(pgno).or_insert_with(|| data.to_vec());
            pos += rec_size;
            if remaining != JOURNAL_REC_COUNT_TO_EOF {
                remaining -= 1;
            }
        }

        // Следующий сегмент — заголовок на ближайшей границе сектора.
        let sector = seg.sector_size as u64;
        let aligned = (pos + sector - 1) / sector * sector;
        if aligned + JOURNAL_HDR_SIZE as u64 > file_len {
            break;
        }
        f.read_exact_at(&mut hdr_buf, aligned)?;
        match parse_journal_header(&hdr_buf) {
            Some(h) => {
                seg = h;
                pos = aligned + seg.sector_size as u64;
            }
            None => break,
        }
    }

    Ok(Some((first, images)))
}

// -------- Write-ahead log --------

pub const WAL_HDR_SIZE: usize = 32;
pub const WAL_FRAME_HDR_SIZE: usize = 24;
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;
pub const WAL_VERSION: u32 = 3_007_000;

/// Заголовок WAL-файла движка.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub page_size: u32,
    pub ckpt_seq: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub cksum1: u32,
    pub cksum2: u32,
}

impl WalHeader {
    /// Порядок байт для кумулятивной контрольной суммы задаётся младшим
    /// битом magic.
    #[inline]
    pub fn checksum_big_endian(&self) -> bool {
        self.magic & 1 != 0
    }
}

/// Заголовок кадра WAL.
#[derive(Debug, Clone, Copy)]
pub struct WalFrameHeader {
    pub pgno: u32,
    /// Размер базы в страницах после коммита; 0 — не коммит-кадр.
    pub commit: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub cksum1: u32,
    pub cksum2: u32,
}

/// Кумулятивная контрольная сумма WAL поверх 8-байтовых слов.
pub fn wal_checksum(big_endian: bool, mut s1: u32, mut s2: u32, data: &[u8]) -> (u32, u32) {
    debug_assert!(data.len() % 8 == 0);
    for chunk in data.chunks_exact(8) {
        let (x1, x2) = if big_endian {
            (BigEndian::read_u32(&chunk[0..4]), BigEndian::read_u32(&chunk[4..8]))
        } else {
            (
                byteorder::LittleEndian::read_u32(&chunk[0..4]),
                byteorder::LittleEndian::read_u32(&chunk[4..8]),
            )
        };
        s1 = s1.wrapping_add(x1).wrapping_add(s2);
        s2 = s2.wrapping_add(x2).wrapping_add(s1);
    }
    (s1, s2)
}

/// Разобрать и проверить заголовок WAL. Err(Invalid) — это не WAL.
pub fn parse_wal_header(buf: &[u8]) -> Result<WalHeader> {
    if buf.len() < WAL_HDR_SIZE {
        return Err(anyhow!(Error::Invalid).context("short wal header"));
    }
    let magic = BigEndian::read_u32(&buf[0..4]);
    if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
        return Err(anyhow!(Error::Invalid).context("bad wal magic"));
    }
    let version = BigEndian::read_u32(&buf[4..8]);
    if version != WAL_VERSION {
        return Err(anyhow!(Error::Invalid).context(format!("unsupported wal version {}", version)));
    }
    let hdr = WalHeader {
        magic,
        page_size: BigEndian::read_u32(&buf[8..12]),
        ckpt_seq: BigEndian::read_u32(&buf[12..16]),
        salt1: BigEndian::read_u32(&buf[16..20]),
        salt2: BigEndian::read_u32(&buf[20..24]),
        cksum1: BigEndian::read_u32(&buf[24..28]),
        cksum2: BigEndian::read_u32(&buf[28..32]),
    };
    validate_page_size(hdr.page_size)?;
    let (s1, s2) = wal_checksum(hdr.checksum_big_endian(), 0, 0, &buf[0..24]);
    if s1 != hdr.cksum1 || s2 != hdr.cksum2 {
        return Err(anyhow!(Error::Invalid).context("wal header checksum mismatch"));
    }
    Ok(hdr)
}

/// Сериализовать заголовок WAL (нужен тестам и восстановлению после
/// усечения). Контрольная сумма пересчитывается.
pub fn encode_wal_header(hdr: &WalHeader) -> [u8; WAL_HDR_SIZE] {
    let mut buf = [0u8; WAL_HDR_SIZE];
    BigEndian::write_u32(&mut buf[0..4], hdr.magic);
    BigEndian::write_u32(&mut buf[4..8], WAL_VERSION);
    BigEndian::write_u32(&mut buf[8..12], hdr.page_size);
    BigEndian::write_u32(&mut buf[12..16], hdr.ckpt_seq);
    BigEndian::write_u32(&mut buf[16..20], hdr.salt1);
    BigEndian::write_u32(&mut buf[20..24], hdr.salt2);
    let (s1, s2) = wal_checksum(hdr.checksum_big_endian(), 0, 0, &buf[0..24]);
    BigEndian::write_u32(&mut buf[24..28], s1);
    BigEndian::write_u32(&mut buf[28..32], s2);
    buf
}

pub fn parse_wal_frame_header(buf: &[u8]) -> WalFrameHeader {
    WalFrameHeader {
        pgno: BigEndian::read_u32(&buf[0..4]),
        commit: BigEndian::read_u32(&buf[4..8]),
        salt1: BigEndian::read_u32(&buf[8..12]),
        salt2: BigEndian::read_u32(&buf[12..16]),
        cksum1: BigEndian::read_u32(&buf[16..20]),
        cksum2: BigEndian::read_u32(&buf[20..24]),
    }
}

/// Собрать кадр WAL: заголовок + данные страницы, с продолжением
/// кумулятивной суммы (s1, s2). Возвращает (кадр, новая пара сумм).
pub fn encode_wal_frame(
    hdr: &WalHeader,
    pgno: u32,
    commit: u32,
    s1: u32,
    s2: u32,
    page: &[u8],
) -> (Vec<u8>, (u32, u32)) {
    let mut frame = vec![0u8; WAL_FRAME_HDR_SIZE + page.len()];
    BigEndian::write_u32(&mut frame[0..4], pgno);
    BigEndian::write_u32(&mut frame[4..8], commit);
    BigEndian::write_u32(&mut frame[8..12], hdr.salt1);
    BigEndian::write_u32(&mut frame[12..16], hdr.salt2);
    let be = hdr.checksum_big_endian();
    let (s1, s2) = wal_checksum(be, s1, s2, &frame[0..8]);
    let (s1, s2) = wal_checksum(be, s1, s2, page);
    BigEndian::write_u32(&mut frame[16..20], s1);
    BigEndian::write_u32(&mut frame[20..24], s2);
    frame[WAL_FRAME_HDR_SIZE..].copy_from_slice(page);
    (frame, (s1, s2))
}

/// Прочитать ровно len байт с позиции или None при EOF (частичный хвост).
pub fn read_exact_at_or_eof(f: &File, buf: &mut [u8], off: u64, file_len: u64) -> Result<bool> {
    if off + buf.len() as u64 > file_len {
        return Ok(false);
    }
    f.read_exact_at(buf, off)?;
    Ok(true)
}

/// Прочитать len байт из Read или None при чистом EOF.
pub fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    use std::io::ErrorKind;
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => {
                if off == 0 {
                    return Ok(false);
                }
                return Err(anyhow!(Error::Io).context("unexpected eof mid-record"));
            }
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(anyhow!(e).context("read")),
        }
    }
    Ok(true)
}
