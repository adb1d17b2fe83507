//! Путь реплики: применение кадров стрима, инвалидация кэша ядра,
//! read-only на не-primary, фоновый монитор с mock-клиентом.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};

use quiverfs::sqlite::{journal_record_checksum, JOURNAL_MAGIC};
use quiverfs::store::stream::{read_frame, write_frame, StreamFrame};
use quiverfs::store::Cancel;
use quiverfs::{Client, Config, Db, Invalidator, Pos, StaticLeaser, Store};

const PS: u32 = 512;
const SECTOR: usize = 512;
const NONCE: u32 = 0x5151_0001;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qfstest-replica-{prefix}-{pid}-{t}-{id}"))
}

fn open_primary(root: &PathBuf) -> Result<Arc<Store>> {
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

/// Два коммита на primary; возвращает стрим-байты с обоими кадрами.
fn primary_stream_bytes(src: &Db) -> Result<Vec<u8>> {
    let page1 = header_page(2, 0x00);
    let page2 = vec![0x22u8; PS as usize];
    run_txn(src, &journal_bytes(0, &[]), &[(1, &page1), (2, &page2)])?;
    let page2b = vec![0x33u8; PS as usize];
    run_txn(src, &journal_bytes(2, &[(2, &page2)]), &[(2, &page2b)])?;

    let mut out = Vec::new();
    write_frame(&mut out, src.id(), src.name(), &std::fs::read(src.ltx_path(1, 1))?)?;
    write_frame(&mut out, src.id(), src.name(), &std::fs::read(src.ltx_path(2, 2))?)?;
    Ok(out)
}

/// Инвалидатор, записывающий вызовы.
#[derive(Default)]
struct RecordingInvalidator {
    calls: Mutex<Vec<(u32, i64, i64)>>,
}

impl Invalidator for RecordingInvalidator {
    fn invalidate(&self, db_id: u32, offset: i64, len: i64) -> Result<()> {
        self.calls.lock().unwrap().push((db_id, offset, len));
        Ok(())
    }
}

#[test]
fn apply_stream_frames_reproduces_database() -> Result<()> {
    let src_store = open_primary(&unique_root("src"))?;
    let src = src_store.create_db("app.db")?;
    let stream = primary_stream_bytes(&src)?;

    let dst_store = open_primary(&unique_root("dst"))?;
    let inv = Arc::new(RecordingInvalidator::default());
    let inv_dyn: Arc<dyn Invalidator> = inv.clone();
    dst_store.set_invalidator(Some(inv_dyn));

    let mut r = &stream[..];
    while let Some(frame) = read_frame(&mut r)? {
        dst_store.apply_stream_frame(&frame)?;
    }

    let dst = dst_store.find_db_by_name("app.db").expect("replica db");
    assert_eq!(dst.pos(), src.pos());
    assert_eq!(
        std::fs::read(dst.path().join("database"))?,
        std::fs::read(src.path().join("database"))?
    );

    // инвалидация отработала до наблюдаемой позиции
    let calls = inv.calls.lock().unwrap();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|(id, _, _)| *id == dst.id()));

    src_store.close()?;
    dst_store.close()?;
    Ok(())
}

#[test]
fn replica_reports_positions_for_stream_request() -> Result<()> {
    let store = open_primary(&unique_root("posmap"))?;
    let db = store.create_db("a.db")?;
    let page1 = header_page(1, 0x00);
    run_txn(&db, &journal_bytes(0, &[]), &[(1, &page1)])?;

    let map = store.pos_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map[&db.id()].txid, 1);

    store.close()?;
    Ok(())
}

/// Mock-транспорт: отдаёт подготовленный буфер один раз, дальше пустые
/// стримы. Запоминает присланную карту позиций.
struct OneShotClient {
    payload: Mutex<Option<Vec<u8>>>,
    seen_pos: Mutex<Vec<HashMap<u32, Pos>>>,
}

impl Client for OneShotClient {
    fn stream(
        &self,
        _ctx: &Cancel,
        _url: &str,
        _node_id: &str,
        pos: &HashMap<u32, Pos>,
    ) -> Result<Box<dyn Read + Send>> {
        self.seen_pos.lock().unwrap().push(pos.clone());
        let payload = self.payload.lock().unwrap().take().unwrap_or_default();
        Ok(Box::new(Cursor::new(payload)))
    }
}

#[test]
fn replica_monitor_applies_stream_from_primary() -> Result<()> {
    let src_store = open_primary(&unique_root("mon-src"))?;
    let src = src_store.create_db("app.db")?;
    let stream = primary_stream_bytes(&src)?;
    let src_pos = src.pos();

    let client = Arc::new(OneShotClient {
        payload: Mutex::new(Some(stream)),
        seen_pos: Mutex::new(Vec::new()),
    });
    let client_dyn: Arc<dyn Client> = client.clone();
    let leaser: Arc<dyn quiverfs::Leaser> =
        Arc::new(StaticLeaser::new(false, "primary", "http://primary:20202"));
    let replica_store = Store::open(
        unique_root("mon-dst"),
        Config::default()
            .with_compact_interval_secs(0)
            .with_lease_backoff_ms(10),
        Some(leaser),
        Some(client_dyn),
    )?;
    assert!(replica_store.wait_ready(Duration::from_secs(5)));
    assert!(!replica_store.is_primary());

    // монитор применяет кадры в фоне
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(db) = replica_store.find_db_by_name("app.db") {
            if db.pos() == src_pos {
                break;
            }
        }
        assert!(Instant::now() < deadline, "replica never caught up");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(!client.seen_pos.lock().unwrap().is_empty());
    src_store.close()?;
    replica_store.close()?;
    Ok(())
}

#[test]
fn stream_frame_codec_is_symmetric() -> Result<()> {
    let mut buf = Vec::new();
    write_frame(&mut buf, 3, "db", b"abc")?;
    let StreamFrame {
        db_id,
        db_name,
        record,
    } = read_frame(&mut &buf[..])?.expect("frame");
    assert_eq!((db_id, db_name.as_str(), record.as_slice()), (3, "db", &b"abc"[..]));
    Ok(())
}
