//! db/write — запись в файл базы и shm, усечение базы.
//!
//! Прямые записи в файл базы проходят насквозь. Что они значат — зависит
//! от контекста: при открытом журнале это тело транзакции (страницы
//! попадают в shadow-набор), при активном WAL — чекпойнт, иначе база
//! помечается «грязной вне сессии» и состояние будет запечатано ближайшим
//! коммитом журнала/WAL.

use anyhow::{Context, Result};
use std::os::unix::fs::FileExt;

use crate::db::core::{Db, FileType};
use crate::sqlite::{page_size_from_header, DB_HEADER_SIZE};

impl Db {
    /// Запись в файл базы (VACUUM, восстановление, чекпойнт, тело
    /// журнальной транзакции).
    pub fn write_database(&self, data: &[u8], off: u64) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut st = self.lock_state();

        // Первая запись заголовка определяет размер страницы.
        if off == 0 && data.len() >= DB_HEADER_SIZE {
            if let Some(ps) = page_size_from_header(data) {
                if st.page_size == 0 {
                    st.page_size = ps;
                }
            }
        }

        let f = self.file_or_create(FileType::Database)?;
        f.write_all_at(data, off).context("write database")?;

        if st.journal.open {
            if st.page_size > 0 {
                let ps = st.page_size as u64;
                let first = off / ps + 1;
                let last = (off + data.len() as u64 - 1) / ps + 1;
                for pgno in first..=last {
                    st.journal.shadow.insert(pgno as u32);
                }
            }
        } else if st.wal.hdr.is_some() {
            // чекпойнт: эти страницы уже отражены в логе WAL-коммитами
        } else {
            st.dirty = true;
            if st.page_size > 0 {
                let ps = st.page_size as u64;
                let first = off / ps + 1;
                let last = (off + data.len() as u64 - 1) / ps + 1;
                for pgno in first..=last {
                    st.dirty_pages.insert(pgno as u32);
                }
            }
        }
        Ok(())
    }

    /// Усечение файла базы (setattr size).
    pub fn truncate_database(&self, size: u64) -> Result<()> {
        let mut st = self.lock_state();
        let f = self.file_or_create(FileType::Database)?;
        f.set_len(size).context("truncate database")?;
        if !st.journal.open && st.wal.hdr.is_none() {
            st.dirty = true;
        }
        Ok(())
    }

    /// Запись в shm: pass-through, наблюдателей не касается.
    pub fn write_shm(&self, data: &[u8], off: u64) -> Result<()> {
        let f = self.file_or_create(FileType::Shm)?;
        f.write_all_at(data, off).context("write shm")?;
        Ok(())
    }

    /// Создание shm поверхностью ФС.
    pub fn create_shm(&self) -> Result<()> {
        self.file_or_create(FileType::Shm)?;
        Ok(())
    }

    /// Усечение shm.
    pub fn truncate_shm(&self, size: u64) -> Result<()> {
        let f = self.file_or_create(FileType::Shm)?;
        f.set_len(size).context("truncate shm")?;
        Ok(())
    }
}
