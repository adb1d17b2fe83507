// src/pos.rs — позиция базы данных (txid + пост-чексумма).
//
// Формат текстового представления (файл "<name>-pos"):
//   "%016x/%016x\n"  — всегда ровно 34 байта.
//
// txid == 0 означает "транзакций ещё не было"; первая закоммиченная
// транзакция имеет txid == 1.

use anyhow::{anyhow, Result};

use crate::error::Error;

/// Длина текстового представления Pos (16 + 1 + 16 + 1).
pub const POS_STR_LEN: usize = 34;

/// Позиция базы: id последней применённой транзакции и контрольная сумма
/// состояния после её применения. Монотонно неубывающая.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pos {
    pub txid: u64,
    pub post_apply_checksum: u64,
}

impl Pos {
    pub fn new(txid: u64, post_apply_checksum: u64) -> Self {
        Self {
            txid,
            post_apply_checksum,
        }
    }

    /// Нулевая позиция (база без транзакций)?
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.txid == 0 && self.post_apply_checksum == 0
    }

    /// Сериализация в фиксированные 34 байта для файла "-pos".
    pub fn format_bytes(&self) -> [u8; POS_STR_LEN] {
        let s = format!("{:016x}/{:016x}\n", self.txid, self.post_apply_checksum);
        let mut out = [0u8; POS_STR_LEN];
        out.copy_from_slice(s.as_bytes());
        out
    }

    /// Разбор представления из format_bytes. Строгий: длина и разделители
    /// проверяются, мусор не допускается.
    pub fn parse_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != POS_STR_LEN || buf[16] != b'/' || buf[33] != b'\n' {
            return Err(anyhow!(Error::Invalid).context("malformed pos representation"));
        }
        let txid = parse_hex16(&buf[0..16])?;
        let post = parse_hex16(&buf[17..33])?;
        Ok(Self::new(txid, post))
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}/{:016x}", self.txid, self.post_apply_checksum)
    }
}

fn parse_hex16(b: &[u8]) -> Result<u64> {
    let s = std::str::from_utf8(b).map_err(|_| anyhow!(Error::Invalid))?;
    u64::from_str_radix(s, 16).map_err(|_| anyhow!(Error::Invalid).context("bad hex in pos"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_format_parse_roundtrip() {
        let p = Pos::new(0x1b, 0x8e4c_1234_dead_beef);
        let bytes = p.format_bytes();
        assert_eq!(bytes.len(), POS_STR_LEN);
        assert_eq!(&bytes[..17], b"000000000000001b/");
        assert_eq!(bytes[33], b'\n');

        let back = Pos::parse_bytes(&bytes).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn pos_zero_is_zero() {
        assert!(Pos::default().is_zero());
        assert!(!Pos::new(1, 0).is_zero());
    }

    #[test]
    fn pos_parse_rejects_garbage() {
        assert!(Pos::parse_bytes(b"short").is_err());
        let mut bytes = Pos::new(7, 9).format_bytes();
        bytes[16] = b':';
        assert!(Pos::parse_bytes(&bytes).is_err());
    }
}
