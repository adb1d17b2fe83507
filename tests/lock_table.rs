//! Трансляция блокировок поверхности: два хэндла одной базы, переходы по
//! байтовым диапазонам движка.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use quiverfs::db::{FileType, LockLevel, LockName};
use quiverfs::fuse::handle::FileHandle;
use quiverfs::fuse::inode::{
    lock_names_in_range, LOCK_PENDING, LOCK_RESERVED, LOCK_SHARED_FIRST, LOCK_SHARED_SIZE,
};
use quiverfs::{Config, StaticLeaser, Store};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qfstest-locks-{prefix}-{pid}-{t}-{id}"))
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

fn shared_range() -> Vec<LockName> {
    lock_names_in_range(LOCK_SHARED_FIRST, LOCK_SHARED_FIRST + LOCK_SHARED_SIZE - 1)
}

#[test]
fn shared_readers_block_upgrade_until_release() -> Result<()> {
    let root = unique_root("upgrade");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;

    let mut h1 = FileHandle::new(1, db.clone(), FileType::Database);
    let mut h2 = FileHandle::new(2, db.clone(), FileType::Database);

    // оба берут shared
    assert!(h1.setlk(LockLevel::Read, &shared_range()));
    assert!(h2.setlk(LockLevel::Read, &shared_range()));

    // апгрейд при живом втором читателе — отказ (EAGAIN на поверхности)
    assert!(!h1.setlk(LockLevel::Write, &shared_range()));
    assert!(!h1.getlk(LockLevel::Write, &shared_range()));

    // второй отпустил — апгрейд проходит
    assert!(h2.setlk(LockLevel::Unlocked, &shared_range()));
    assert!(h1.getlk(LockLevel::Write, &shared_range()));
    assert!(h1.setlk(LockLevel::Write, &shared_range()));

    // третий хэндл не получит shared, пока держится write
    let mut h3 = FileHandle::new(3, db.clone(), FileType::Database);
    assert!(!h3.setlk(LockLevel::Read, &shared_range()));

    store.close()?;
    Ok(())
}

#[test]
fn write_transaction_lock_sequence() -> Result<()> {
    // последовательность движка: SHARED → RESERVED → PENDING+EXCLUSIVE
    let root = unique_root("sequence");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;

    let mut writer = FileHandle::new(1, db.clone(), FileType::Database);
    let mut reader = FileHandle::new(2, db.clone(), FileType::Database);

    assert!(writer.setlk(LockLevel::Read, &shared_range()));
    assert!(writer.setlk(
        LockLevel::Write,
        &lock_names_in_range(LOCK_RESERVED, LOCK_RESERVED)
    ));

    // параллельный читатель всё ещё может взять shared при reserved
    assert!(reader.setlk(LockLevel::Read, &shared_range()));

    // но эксклюзив по всему диапазону не пройдёт, пока читатель жив
    let all = lock_names_in_range(LOCK_PENDING, LOCK_SHARED_FIRST + LOCK_SHARED_SIZE);
    assert_eq!(all.len(), 3);
    assert!(!writer.setlk(LockLevel::Write, &all));

    assert!(reader.setlk(LockLevel::Unlocked, &shared_range()));
    assert!(writer.setlk(LockLevel::Write, &all));

    store.close()?;
    Ok(())
}

#[test]
fn release_locks_frees_table_for_others() -> Result<()> {
    let root = unique_root("release");
    let store = open_store(&root)?;
    let db = store.create_db("db")?;

    let mut h1 = FileHandle::new(1, db.clone(), FileType::Database);
    let mut h2 = FileHandle::new(2, db.clone(), FileType::Database);

    assert!(h1.setlk(LockLevel::Write, &shared_range()));
    assert!(!h2.setlk(LockLevel::Read, &shared_range()));

    // закрытие дескриптора снимает всё удерживаемое
    h1.release_locks();
    assert!(h2.setlk(LockLevel::Read, &shared_range()));

    store.close()?;
    Ok(())
}
