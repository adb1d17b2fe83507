//! store/stream — кадрирование логического стрима транзакций.
//!
//! Байтовый поток от primary несёт кадры {база, дельта-запись}:
//!
//!   header = [magic4 "QSTF"][db_id u32][name_len u16][rec_len u32][crc u32]
//!   затем  [name bytes][record bytes]
//!
//! Все поля LE; crc — CRC32C по заголовку (без поля crc) и имени базы.
//! Целостность самой записи гарантирует её собственный трейлер.
//! Неполный хвост потока — чистый EOF; испорченный заголовок — ошибка.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};

use crate::error::Error;
use crate::sqlite::read_exact_or_eof;
use crate::store::Store;

pub const STREAM_MAGIC: &[u8; 4] = b"QSTF";
pub const STREAM_HDR_SIZE: usize = 4 + 4 + 2 + 4 + 4;

/// Максимальный размер одной записи в стриме (защита от мусора).
pub const STREAM_MAX_RECORD: usize = 1 << 30;

/// Один кадр стрима репликации.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub db_id: u32,
    pub db_name: String,
    pub record: Vec<u8>,
}

/// Записать кадр в поток.
pub fn write_frame<W: Write>(w: &mut W, db_id: u32, db_name: &str, record: &[u8]) -> Result<()> {
    let name = db_name.as_bytes();
    if name.len() > u16::MAX as usize {
        return Err(anyhow!(Error::Invalid).context("database name too long for stream frame"));
    }
    if record.len() > STREAM_MAX_RECORD {
        return Err(anyhow!(Error::Invalid).context("record too large for stream frame"));
    }

    let mut hdr = [0u8; STREAM_HDR_SIZE];
    hdr[0..4].copy_from_slice(STREAM_MAGIC);
    LittleEndian::write_u32(&mut hdr[4..8], db_id);
    LittleEndian::write_u16(&mut hdr[8..10], name.len() as u16);
    LittleEndian::write_u32(&mut hdr[10..14], record.len() as u32);
    let crc = crc32c::crc32c_append(crc32c::crc32c(&hdr[0..14]), name);
    LittleEndian::write_u32(&mut hdr[14..18], crc);

    w.write_all(&hdr)?;
    w.write_all(name)?;
    w.write_all(record)?;
    Ok(())
}

/// Прочитать следующий кадр. Ok(None) — чистый конец потока.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<StreamFrame>> {
    let mut hdr = [0u8; STREAM_HDR_SIZE];
    if !read_exact_or_eof(r, &mut hdr)? {
        return Ok(None);
    }
    if &hdr[0..4] != STREAM_MAGIC {
        return Err(anyhow!(Error::Invalid).context("bad stream frame magic"));
    }
    let db_id = LittleEndian::read_u32(&hdr[4..8]);
    let name_len = LittleEndian::read_u16(&hdr[8..10]) as usize;
    let rec_len = LittleEndian::read_u32(&hdr[10..14]) as usize;
    let stored_crc = LittleEndian::read_u32(&hdr[14..18]);
    if rec_len > STREAM_MAX_RECORD {
        return Err(anyhow!(Error::Invalid)
            .context(format!("stream record too large: {}", rec_len)));
    }

    let mut name = vec![0u8; name_len];
    if !read_exact_or_eof(r, &mut name)? {
        return Ok(None);
    }
    let calc_crc = crc32c::crc32c_append(crc32c::crc32c(&hdr[0..14]), &name);
    if calc_crc != stored_crc {
        return Err(anyhow!(Error::Corrupt).context("stream frame header crc mismatch"));
    }

    let mut record = vec![0u8; rec_len];
    if !read_exact_or_eof(r, &mut record)? {
        return Ok(None);
    }
    let db_name = String::from_utf8(name)
        .map_err(|_| anyhow!(Error::Invalid).context("stream frame name is not utf-8"))?;
    Ok(Some(StreamFrame {
        db_id,
        db_name,
        record,
    }))
}

impl Store {
    /// Подключиться к primary и применять кадры до разрыва/отмены.
    pub(crate) fn stream_from_primary(&self, url: &str) -> Result<()> {
        let Some(client) = self.client() else {
            return Ok(()); // транспорт не сконфигурирован
        };
        let ctx = self.closing.child();
        let pos_map = self.pos_map();
        let mut stream = client
            .stream(&ctx, url, self.id(), &pos_map)
            .context("open replication stream")?;

        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let Some(frame) = read_frame(&mut stream)? else {
                return Ok(());
            };
            self.apply_stream_frame(&frame)?;
        }
    }

    /// Применить один кадр стрима: найти/создать базу и применить запись.
    pub fn apply_stream_frame(&self, frame: &StreamFrame) -> Result<()> {
        let db = match self.find_db_by_name(&frame.db_name) {
            Some(db) => db,
            None => self
                .create_db(&frame.db_name)
                .with_context(|| format!("create replica db {:?}", frame.db_name))?,
        };
        db.apply_ltx_bytes(&frame.record)
            .with_context(|| format!("apply stream record to {:?}", frame.db_name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, "app.db", b"record-bytes").unwrap();
        write_frame(&mut buf, 8, "other.db", b"").unwrap();

        let mut r = &buf[..];
        let f1 = read_frame(&mut r).unwrap().unwrap();
        assert_eq!(f1.db_id, 7);
        assert_eq!(f1.db_name, "app.db");
        assert_eq!(f1.record, b"record-bytes");
        let f2 = read_frame(&mut r).unwrap().unwrap();
        assert_eq!(f2.db_id, 8);
        assert!(f2.record.is_empty());
        assert!(read_frame(&mut r).unwrap().is_none());
    }

    #[test]
    fn frame_detects_header_corruption() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, "db", b"payload").unwrap();
        buf[5] ^= 0xff; // db_id
        let err = read_frame(&mut &buf[..]).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(Error::Corrupt));
    }

    #[test]
    fn partial_tail_is_clean_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 1, "db", b"payload").unwrap();
        buf.truncate(buf.len() - 3);
        // неполный record → поток оборван посреди кадра: это ошибка IO,
        // а не тихое усечение
        assert!(read_frame(&mut &buf[..]).is_err());

        // а обрыв ровно на границе кадров — чистый EOF
        let mut buf2 = Vec::new();
        write_frame(&mut buf2, 1, "db", b"payload").unwrap();
        let mut r = &buf2[..];
        read_frame(&mut r).unwrap().unwrap();
        assert!(read_frame(&mut r).unwrap().is_none());
    }
}
