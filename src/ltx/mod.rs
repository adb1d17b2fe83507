//! ltx — дельта-записи транзакций (формат LTX).
//!
//! Разделение:
//! - checksum.rs — по-страничные и rolling-чексуммы базы (XXH64 + XOR-алгебра).
//! - encode.rs   — потоковый писатель записи (заголовок → кадры → трейлер).
//! - decode.rs   — потоковый читатель с валидацией трейлера.
//! - dir.rs      — каталог лога транзакций: публикация, перечисление,
//!   компактация префикса, усечение хвоста.
//!
//! В этом mod.rs лежат константы формата и заголовок записи.
//!
//! Формат файла (little-endian):
//!   header(52) = [magic4 "QLTX"][version u16][page_size u16][commit u32]
//!                [min_txid u64][max_txid u64][pre_cksum u64][post_cksum u64]
//!                [timestamp_ms u64]
//!   body       = кадры [pgno u32][data page_size], pgno строго возрастает,
//!                lock-страница движка не встречается никогда
//!   trailer(8) = XXH64(seed=0) по header+body
//!
//! page_size на проводе — u16 с конвенцией движка: 1 означает 65536.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::sqlite::validate_page_size;

pub mod checksum;
pub mod decode;
pub mod dir;
pub mod encode;

pub use decode::LtxReader;
pub use encode::LtxWriter;

pub const LTX_MAGIC: &[u8; 4] = b"QLTX";
pub const LTX_VERSION: u16 = 1;
pub const LTX_HDR_SIZE: usize = 52;
pub const LTX_TRAILER_SIZE: usize = 8;
pub const LTX_EXT: &str = "ltx";

/// Заголовок дельта-записи.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LtxHeader {
    pub page_size: u32,
    /// Размер базы (в страницах) после применения записи.
    pub commit: u32,
    pub min_txid: u64,
    pub max_txid: u64,
    pub pre_apply_checksum: u64,
    pub post_apply_checksum: u64,
    /// Unix-время эмиссии, миллисекунды.
    pub timestamp: u64,
}

impl LtxHeader {
    /// Полный размер файла записи с n кадрами.
    pub fn file_size(&self, frames: u64) -> u64 {
        LTX_HDR_SIZE as u64
            + frames * (4 + self.page_size as u64)
            + LTX_TRAILER_SIZE as u64
    }

    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.min_txid == 0 || self.min_txid > self.max_txid {
            return Err(anyhow!(Error::Invalid)
                .context(format!("bad txid range {}..{}", self.min_txid, self.max_txid)));
        }
        Ok(())
    }
}

/// page_size -> проводное u16 (конвенция движка: 65536 кодируется как 1).
#[inline]
pub fn page_size_to_wire(page_size: u32) -> u16 {
    if page_size == 65536 {
        1
    } else {
        page_size as u16
    }
}

/// Проводное u16 -> page_size.
#[inline]
pub fn page_size_from_wire(raw: u16) -> u32 {
    if raw == 1 {
        65536
    } else {
        raw as u32
    }
}

/// Сериализовать заголовок в 52 байта.
pub fn encode_header(h: &LtxHeader) -> [u8; LTX_HDR_SIZE] {
    let mut buf = [0u8; LTX_HDR_SIZE];
    buf[0..4].copy_from_slice(LTX_MAGIC);
    LittleEndian::write_u16(&mut buf[4..6], LTX_VERSION);
    LittleEndian::write_u16(&mut buf[6..8], page_size_to_wire(h.page_size));
    LittleEndian::write_u32(&mut buf[8..12], h.commit);
    LittleEndian::write_u64(&mut buf[12..20], h.min_txid);
    LittleEndian::write_u64(&mut buf[20..28], h.max_txid);
    LittleEndian::write_u64(&mut buf[28..36], h.pre_apply_checksum);
    LittleEndian::write_u64(&mut buf[36..44], h.post_apply_checksum);
    LittleEndian::write_u64(&mut buf[44..52], h.timestamp);
    buf
}

/// Разобрать заголовок. Все несоответствия формата — Error::Invalid.
pub fn parse_header(buf: &[u8]) -> Result<LtxHeader> {
    if buf.len() < LTX_HDR_SIZE {
        return Err(anyhow!(Error::Invalid).context("short ltx header"));
    }
    if &buf[0..4] != LTX_MAGIC {
        return Err(anyhow!(Error::Invalid).context("bad ltx magic"));
    }
    let version = LittleEndian::read_u16(&buf[4..6]);
    if version != LTX_VERSION {
        return Err(anyhow!(Error::Invalid)
            .context(format!("unsupported ltx version {}", version)));
    }
    let h = LtxHeader {
        page_size: page_size_from_wire(LittleEndian::read_u16(&buf[6..8])),
        commit: LittleEndian::read_u32(&buf[8..12]),
        min_txid: LittleEndian::read_u64(&buf[12..20]),
        max_txid: LittleEndian::read_u64(&buf[20..28]),
        pre_apply_checksum: LittleEndian::read_u64(&buf[28..36]),
        post_apply_checksum: LittleEndian::read_u64(&buf[36..44]),
        timestamp: LittleEndian::read_u64(&buf[44..52]),
    };
    h.validate().context("ltx header validation")?;
    Ok(h)
}
