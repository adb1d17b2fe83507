//! Снапшоты: write_snapshot_to → import в пустую базу воспроизводит
//! позицию и байты файла базы один в один.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};

use quiverfs::sqlite::{journal_record_checksum, JOURNAL_MAGIC};
use quiverfs::{Config, Db, StaticLeaser, Store};

const PS: u32 = 512;
const SECTOR: usize = 512;
const NONCE: u32 = 0x0bad_cafe;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qfstest-snap-{prefix}-{pid}-{t}-{id}"))
}

fn open_store(root: &PathBuf) -> Result<Arc<Store>> {
    let leaser: Arc<dyn quiverfs::Leaser> = Arc::new(StaticLeaser::new(true, "localhost", "http://localhost:20202"));
    let store = Store::open(
        root.clone(),
        Config::default().with_compact_interval_secs(0),
        Some(leaser),
        None,
    )?;
    assert!(store.wait_ready(Duration::from_secs(5)));
    Ok(store)
}

fn header_page(page_count: u32, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; PS as usize];
    page[0..16].copy_from_slice(b"SQLite format 3\0");
    BigEndian::write_u16(&mut page[16..18], PS as u16);
    page[18] = 1;
    page[19] = 1;
    BigEndian::write_u32(&mut page[28..32], page_count);
    page
}

fn journal_bytes(orig_page_count: u32, pre_images: &[(u32, &[u8])]) -> Vec<u8> {
    let mut out = vec![0u8; SECTOR];
    out[0..8].copy_from_slice(&JOURNAL_MAGIC);
    BigEndian::write_u32(&mut out[8..12], pre_images.len() as u32);
    BigEndian::write_u32(&mut out[12..16], NONCE);
    BigEndian::write_u32(&mut out[16..20], orig_page_count);
    BigEndian::write_u32(&mut out[20..24], SECTOR as u32);
    BigEndian::write_u32(&mut out[24..28], PS);
    for (pgno, data) in pre_images {
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, *pgno);
        out.extend_from_slice(&tmp);
        out.extend_from_slice(data);
        BigEndian::write_u32(&mut tmp, journal_record_checksum(NONCE, data));
        out.extend_from_slice(&tmp);
    }
    out
}

fn run_txn(db: &Db, journal: &[u8], pages: &[(u32, &[u8])]) -> Result<()> {
    db.create_journal()?;
    db.write_journal(journal, 0)?;
    for (pgno, data) in pages {
        db.write_database(data, (*pgno as u64 - 1) * PS as u64)?;
    }
    db.unlink_journal()?;
    Ok(())
}

fn seed_db(db: &Db) -> Result<()> {
    let page1 = header_page(3, 0x00);
    let page2 = vec![0x22u8; PS as usize];
    let page3 = vec![0x33u8; PS as usize];
    run_txn(db, &journal_bytes(0, &[]), &[(1, &page1), (2, &page2), (3, &page3)])?;
    let page2b = vec![0x44u8; PS as usize];
    run_txn(db, &journal_bytes(3, &[(2, &page2)]), &[(2, &page2b)])?;
    Ok(())
}

#[test]
fn snapshot_import_reproduces_state() -> Result<()> {
    let src_root = unique_root("src");
    let src_store = open_store(&src_root)?;
    let src = src_store.create_db("db")?;
    seed_db(&src)?;
    assert_eq!(src.txid(), 2);

    let mut snapshot = Vec::new();
    let snap_pos = src_store.write_snapshot_to(&src, &mut snapshot)?;
    assert_eq!(snap_pos, src.pos());

    let dst_root = unique_root("dst");
    let dst_store = open_store(&dst_root)?;
    let dst = dst_store.create_db("db")?;
    let pos = dst_store.import(&dst, &mut &snapshot[..])?;

    assert_eq!(pos, src.pos());
    assert_eq!(dst.pos(), src.pos());
    assert_eq!(dst.page_count(), src.page_count());
    assert_eq!(
        std::fs::read(dst.path().join("database"))?,
        std::fs::read(src.path().join("database"))?
    );

    // импортированная база продолжает цепочку обычными коммитами
    let page3 = vec![0x33u8; PS as usize];
    let page3b = vec![0x55u8; PS as usize];
    run_txn(&dst, &journal_bytes(3, &[(3, &page3)]), &[(3, &page3b)])?;
    assert_eq!(dst.txid(), 3);

    src_store.close()?;
    dst_store.close()?;
    Ok(())
}

#[test]
fn snapshot_survives_reopen_of_importer() -> Result<()> {
    let src_root = unique_root("src2");
    let src_store = open_store(&src_root)?;
    let src = src_store.create_db("db")?;
    seed_db(&src)?;

    let mut snapshot = Vec::new();
    src_store.write_snapshot_to(&src, &mut snapshot)?;
    let src_pos = src.pos();
    let src_bytes = std::fs::read(src.path().join("database"))?;
    src_store.close()?;

    let dst_root = unique_root("dst2");
    let dst_store = open_store(&dst_root)?;
    let dst = dst_store.create_db("db")?;
    dst_store.import(&dst, &mut &snapshot[..])?;
    drop(dst);
    dst_store.close()?;
    drop(dst_store);

    // после перезапуска позиция восстанавливается из единственной записи
    let dst_store = open_store(&dst_root)?;
    let dst = dst_store.find_db_by_name("db").expect("db after reopen");
    assert_eq!(dst.pos(), src_pos);
    assert_eq!(std::fs::read(dst.path().join("database"))?, src_bytes);

    dst_store.close()?;
    Ok(())
}

#[test]
fn import_rejects_non_snapshot_record() -> Result<()> {
    let src_root = unique_root("src3");
    let src_store = open_store(&src_root)?;
    let src = src_store.create_db("db")?;
    seed_db(&src)?;

    // обычная запись txid=2 не самодостаточна (pre != 0)
    let rec = std::fs::read(src.ltx_path(2, 2))?;
    let dst = src_store.create_db("other")?;
    let err = src_store.import(&dst, &mut &rec[..]).unwrap_err();
    assert_eq!(quiverfs::error::kind_of(&err), Some(quiverfs::Error::Invalid));
    assert!(dst.pos().is_zero());

    src_store.close()?;
    Ok(())
}

#[test]
fn snapshot_of_empty_database_is_refused() -> Result<()> {
    let root = unique_root("empty");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;

    let mut out = Vec::new();
    let err = store.write_snapshot_to(&db, &mut out).unwrap_err();
    assert_eq!(quiverfs::error::kind_of(&err), Some(quiverfs::Error::Invalid));

    store.close()?;
    Ok(())
}
