//! Каталог лога транзакций: компактация префикса и защита целостности.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};

use quiverfs::ltx::dir::{compact, enumerate, validate_contiguity};
use quiverfs::ltx::parse_header;
use quiverfs::sqlite::{journal_record_checksum, JOURNAL_MAGIC};
use quiverfs::{Config, Db, StaticLeaser, Store};

const PS: u32 = 512;
const SECTOR: usize = 512;
const NONCE: u32 = 0x7777_0001;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qfstest-ltxlog-{prefix}-{pid}-{t}-{id}"))
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

/// Четыре коммита: страница 2 меняется в каждом.
fn seed_four_txns(db: &Db) -> Result<Vec<Vec<u8>>> {
    let page1 = header_page(2, 0x00);
    let mut page2 = vec![0x10u8; PS as usize];
    run_txn(db, &journal_bytes(0, &[]), &[(1, &page1), (2, &page2)])?;
    let mut versions = vec![page2.clone()];
    for fill in [0x20u8, 0x30, 0x40] {
        let next = vec![fill; PS as usize];
        run_txn(db, &journal_bytes(2, &[(2, &page2)]), &[(2, &next)])?;
        page2 = next;
        versions.push(page2.clone());
    }
    Ok(versions)
}

#[test]
fn compaction_merges_prefix_and_preserves_state() -> Result<()> {
    let root = unique_root("merge");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;
    seed_four_txns(&db)?;
    assert_eq!(db.txid(), 4);
    let pos = db.pos();

    // склеить первые три записи, последнюю оставить
    assert!(compact(&db.ltx_dir(), 1)?);
    let infos = enumerate(&db.ltx_dir())?;
    validate_contiguity(&infos)?;
    assert_eq!(infos.len(), 2);
    assert_eq!((infos[0].min_txid, infos[0].max_txid), (1, 3));
    assert_eq!((infos[1].min_txid, infos[1].max_txid), (4, 4));

    // заголовок склейки сохраняет цепочку: pre первой, post третьей
    let merged = parse_header(&std::fs::read(&infos[0].path)?)?;
    let last = parse_header(&std::fs::read(&infos[1].path)?)?;
    assert_eq!(merged.pre_apply_checksum, 0);
    assert_eq!(merged.post_apply_checksum, last.pre_apply_checksum);
    assert_eq!(last.post_apply_checksum, pos.post_apply_checksum);

    // применение склейки + хвоста к пустой базе даёт те же байты
    let replica_store = open_store(&unique_root("replica"))?;
    let replica = replica_store.create_db("db")?;
    replica.apply_ltx_bytes(&std::fs::read(&infos[0].path)?)?;
    replica.apply_ltx_bytes(&std::fs::read(&infos[1].path)?)?;
    assert_eq!(replica.pos(), pos);
    assert_eq!(
        std::fs::read(replica.path().join("database"))?,
        std::fs::read(db.path().join("database"))?
    );

    // повторная компактация без новых записей — no-op
    assert!(!compact(&db.ltx_dir(), 1)?);

    replica_store.close()?;
    store.close()?;
    Ok(())
}

#[test]
fn reopen_after_compaction_restores_position() -> Result<()> {
    let root = unique_root("reopen");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;
    seed_four_txns(&db)?;
    let pos = db.pos();
    assert!(compact(&db.ltx_dir(), 1)?);
    drop(db);
    store.close()?;
    drop(store);

    let store = open_store(&root)?;
    let db = store.find_db_by_name("db").expect("db after reopen");
    assert_eq!(db.pos(), pos);
    store.close()?;
    Ok(())
}

#[test]
fn corrupt_record_is_fatal_on_apply() -> Result<()> {
    let root = unique_root("corrupt");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;
    seed_four_txns(&db)?;

    let mut rec = std::fs::read(db.ltx_path(1, 1))?;
    let n = rec.len();
    rec[n - 1] ^= 0xff; // трейлер

    let replica = store.create_db("replica")?;
    let err = replica.apply_ltx_bytes(&rec).unwrap_err();
    assert_eq!(quiverfs::error::kind_of(&err), Some(quiverfs::Error::Corrupt));
    assert!(replica.pos().is_zero());

    store.close()?;
    Ok(())
}

#[test]
fn apply_refuses_gap_in_txid_chain() -> Result<()> {
    let root = unique_root("gap");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;
    seed_four_txns(&db)?;

    // запись txid=2 на пустую базу: несовпадение pre-чексуммы
    let rec2 = std::fs::read(db.ltx_path(2, 2))?;
    let replica = store.create_db("replica")?;
    let err = replica.apply_ltx_bytes(&rec2).unwrap_err();
    assert_eq!(quiverfs::error::kind_of(&err), Some(quiverfs::Error::Corrupt));

    store.close()?;
    Ok(())
}
