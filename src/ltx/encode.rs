//! ltx/encode — потоковый писатель дельта-записи.
//!
//! Пишет заголовок при создании, кадры по одному, трейлер в finish().
//! Хэш трейлера считается инкрементально по мере записи, без буферизации
//! всей записи в памяти. Инварианты (возрастание pgno, запрет
//! lock-страницы, размер данных) проверяются на каждом кадре.

use anyhow::{anyhow, Context, Result};
use std::hash::Hasher;
use std::io::Write;
use twox_hash::XxHash64;

use crate::error::Error;
use crate::sqlite::lock_page_number;

use super::{encode_header, LtxHeader};

pub struct LtxWriter<W: Write> {
    w: W,
    hasher: XxHash64,
    page_size: u32,
    lock_pgno: u32,
    last_pgno: u32,
    frames: u64,
}

impl<W: Write> LtxWriter<W> {
    /// Создать писатель и записать заголовок.
    pub fn new(mut w: W, hdr: &LtxHeader) -> Result<Self> {
        hdr.validate()?;
        let buf = encode_header(hdr);
        w.write_all(&buf).context("write ltx header")?;
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&buf);
        Ok(Self {
            w,
            hasher,
            page_size: hdr.page_size,
            lock_pgno: lock_page_number(hdr.page_size),
            last_pgno: 0,
            frames: 0,
        })
    }

    /// Количество записанных кадров.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Записать кадр страницы. pgno строго возрастает; lock-страница
    /// движка не допускается.
    pub fn write_frame(&mut self, pgno: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size as usize {
            return Err(anyhow!(Error::Invalid).context(format!(
                "frame size {} != page size {}",
                data.len(),
                self.page_size
            )));
        }
        if pgno == 0 || pgno <= self.last_pgno {
            return Err(anyhow!(Error::Invalid)
                .context(format!("page numbers must ascend: {} after {}", pgno, self.last_pgno)));
        }
        if pgno == self.lock_pgno {
            return Err(anyhow!(Error::Invalid).context("lock page must not be framed"));
        }

        let pgno_le = pgno.to_le_bytes();
        self.w.write_all(&pgno_le)?;
        self.w.write_all(data)?;
        self.hasher.write(&pgno_le);
        self.hasher.write(data);

        self.last_pgno = pgno;
        self.frames += 1;
        Ok(())
    }

    /// Дописать трейлер и вернуть writer вместе с итоговой чексуммой
    /// записи (content-address).
    pub fn finish(mut self) -> Result<(W, u64)> {
        let sum = self.hasher.finish();
        self.w
            .write_all(&sum.to_le_bytes())
            .context("write ltx trailer")?;
        Ok((self.w, sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ltx::LTX_TRAILER_SIZE;

    fn hdr(ps: u32) -> LtxHeader {
        LtxHeader {
            page_size: ps,
            commit: 2,
            min_txid: 1,
            max_txid: 1,
            pre_apply_checksum: 0,
            post_apply_checksum: crate::ltx::checksum::CHECKSUM_FLAG | 1,
            timestamp: 0,
        }
    }

    #[test]
    fn writer_enforces_ascending_pages() {
        let mut w = LtxWriter::new(Vec::new(), &hdr(512)).unwrap();
        w.write_frame(2, &[0u8; 512]).unwrap();
        assert!(w.write_frame(2, &[0u8; 512]).is_err());
        assert!(w.write_frame(1, &[0u8; 512]).is_err());
        w.write_frame(5, &[0u8; 512]).unwrap();
        assert_eq!(w.frames(), 2);
    }

    #[test]
    fn writer_rejects_lock_page_and_bad_size() {
        let mut w = LtxWriter::new(Vec::new(), &hdr(512)).unwrap();
        assert!(w.write_frame(1, &[0u8; 100]).is_err());
        let lock = crate::sqlite::lock_page_number(512);
        assert!(w.write_frame(lock, &[0u8; 512]).is_err());
    }

    #[test]
    fn writer_output_has_expected_size() {
        let h = hdr(512);
        let mut w = LtxWriter::new(Vec::new(), &h).unwrap();
        w.write_frame(1, &[7u8; 512]).unwrap();
        w.write_frame(2, &[9u8; 512]).unwrap();
        let (buf, sum) = w.finish().unwrap();
        assert_eq!(buf.len() as u64, h.file_size(2));
        assert_eq!(&buf[buf.len() - LTX_TRAILER_SIZE..], &sum.to_le_bytes()[..]);
        assert_eq!(&buf[0..4], crate::ltx::LTX_MAGIC);
    }
}
