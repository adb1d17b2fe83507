//! ltx/decode — потоковый читатель дельта-записи.
//!
//! Формат не содержит счётчика кадров, поэтому читателю передаётся полная
//! длина записи (размер файла или длина кадра стрима); количество кадров
//! выводится из неё и сверяется с кратностью. Несовпадение трейлера —
//! всегда фатально для записи (Error::Corrupt), усечённых чтений не бывает.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::hash::Hasher;
use std::io::Read;
use twox_hash::XxHash64;

use crate::error::Error;
use crate::sqlite::lock_page_number;

use super::{parse_header, LtxHeader, LTX_HDR_SIZE, LTX_TRAILER_SIZE};

pub struct LtxReader<R: Read> {
    r: R,
    hasher: XxHash64,
    hdr: LtxHeader,
    frames_left: u64,
    last_pgno: u32,
    lock_pgno: u32,
}

impl<R: Read> LtxReader<R> {
    /// Открыть запись: прочитать и проверить заголовок, вычислить число
    /// кадров из полной длины.
    pub fn new(mut r: R, total_len: u64) -> Result<Self> {
        let mut buf = [0u8; LTX_HDR_SIZE];
        r.read_exact(&mut buf).context("read ltx header")?;
        let hdr = parse_header(&buf)?;

        let min_len = (LTX_HDR_SIZE + LTX_TRAILER_SIZE) as u64;
        if total_len < min_len {
            return Err(anyhow!(Error::Invalid).context("ltx record too short"));
        }
        let body = total_len - min_len;
        let frame_size = 4 + hdr.page_size as u64;
        if body % frame_size != 0 {
            return Err(anyhow!(Error::Invalid)
                .context(format!("ltx body {} not a multiple of frame size {}", body, frame_size)));
        }

        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&buf);
        Ok(Self {
            r,
            hasher,
            hdr,
            frames_left: body / frame_size,
            last_pgno: 0,
            lock_pgno: lock_page_number(hdr.page_size),
        })
    }

    pub fn header(&self) -> &LtxHeader {
        &self.hdr
    }

    pub fn frames_remaining(&self) -> u64 {
        self.frames_left
    }

    /// Прочитать следующий кадр в buf (ресайзится до page_size).
    /// Ok(None) — кадры закончились, пора звать finish().
    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<Option<u32>> {
        if self.frames_left == 0 {
            return Ok(None);
        }
        let mut pgno_buf = [0u8; 4];
        self.r.read_exact(&mut pgno_buf).context("read ltx frame pgno")?;
        let pgno = LittleEndian::read_u32(&pgno_buf);

        buf.resize(self.hdr.page_size as usize, 0);
        self.r.read_exact(buf).context("read ltx frame data")?;

        if pgno == 0 || pgno <= self.last_pgno {
            return Err(anyhow!(Error::Invalid)
                .context(format!("page numbers must ascend: {} after {}", pgno, self.last_pgno)));
        }
        if pgno == self.lock_pgno {
            return Err(anyhow!(Error::Invalid).context("lock page framed in ltx record"));
        }

        self.hasher.write(&pgno_buf);
        self.hasher.write(buf);
        self.last_pgno = pgno;
        self.frames_left -= 1;
        Ok(Some(pgno))
    }

    /// Прочитать и сверить трейлер. Возвращает чексумму записи.
    pub fn finish(mut self) -> Result<u64> {
        if self.frames_left != 0 {
            return Err(anyhow!(Error::Invalid)
                .context(format!("{} ltx frames left unread", self.frames_left)));
        }
        let mut trailer = [0u8; LTX_TRAILER_SIZE];
        self.r.read_exact(&mut trailer).context("read ltx trailer")?;
        let stored = LittleEndian::read_u64(&trailer);
        let calc = self.hasher.finish();
        if stored != calc {
            return Err(anyhow!(Error::Corrupt).context(format!(
                "ltx trailer mismatch (stored={:016x}, calc={:016x})",
                stored, calc
            )));
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ltx::checksum::CHECKSUM_FLAG;
    use crate::ltx::LtxWriter;

    fn sample_record() -> (Vec<u8>, LtxHeader) {
        let hdr = LtxHeader {
            page_size: 512,
            commit: 2,
            min_txid: 3,
            max_txid: 3,
            pre_apply_checksum: CHECKSUM_FLAG | 5,
            post_apply_checksum: CHECKSUM_FLAG | 6,
            timestamp: 123,
        };
        let mut w = LtxWriter::new(Vec::new(), &hdr).unwrap();
        w.write_frame(1, &[0x11u8; 512]).unwrap();
        w.write_frame(2, &[0x22u8; 512]).unwrap();
        let (buf, _) = w.finish().unwrap();
        (buf, hdr)
    }

    #[test]
    fn reader_roundtrip() {
        let (buf, hdr) = sample_record();
        let mut r = LtxReader::new(&buf[..], buf.len() as u64).unwrap();
        assert_eq!(*r.header(), hdr);
        assert_eq!(r.frames_remaining(), 2);

        let mut page = Vec::new();
        assert_eq!(r.next_frame(&mut page).unwrap(), Some(1));
        assert!(page.iter().all(|&b| b == 0x11));
        assert_eq!(r.next_frame(&mut page).unwrap(), Some(2));
        assert_eq!(r.next_frame(&mut page).unwrap(), None);
        r.finish().unwrap();
    }

    #[test]
    fn reader_detects_corrupt_trailer() {
        let (mut buf, _) = sample_record();
        let n = buf.len();
        buf[n - 1] ^= 0xff;
        let mut r = LtxReader::new(&buf[..], n as u64).unwrap();
        let mut page = Vec::new();
        while r.next_frame(&mut page).unwrap().is_some() {}
        let err = r.finish().unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(Error::Corrupt));
    }

    #[test]
    fn reader_detects_corrupt_body() {
        let (mut buf, _) = sample_record();
        buf[LTX_HDR_SIZE + 10] ^= 0xff; // данные первого кадра
        let mut r = LtxReader::new(&buf[..], buf.len() as u64).unwrap();
        let mut page = Vec::new();
        while r.next_frame(&mut page).unwrap().is_some() {}
        assert!(r.finish().is_err());
    }

    #[test]
    fn reader_rejects_misaligned_length() {
        let (buf, _) = sample_record();
        assert!(LtxReader::new(&buf[..], buf.len() as u64 + 3).is_err());
    }
}
