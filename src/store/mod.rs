//! store — коллекция баз данных узла.
//!
//! Разделение по подмодулям:
//! - mod.rs    — структура Store, раскладка на диске, открытие/создание баз
//! - lease.rs  — токены отмены, сигнал готовности, монитор аренды
//! - stream.rs — кадрирование и применение стрима репликации
//!
//! Раскладка корня:
//!   <root>/id            — идентификатор узла (24 hex-символа)
//!   <root>/LOCK          — эксклюзивная межпроцессная блокировка (fs2)
//!   <root>/dbs/<hex8>/   — каталог базы: name, database, journal, wal,
//!                          shm, ltx/<min>-<max>.ltx

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use rand::RngCore;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::config::Config;
use crate::db::core::{Db, InvalidatorSlot, FILE_DATABASE, FILE_NAME};
use crate::error::Error;
use crate::ltx::dir as ltxdir;
use crate::pos::Pos;
use crate::remote::{Client, Invalidator, Leaser};
use crate::util::{format_hex8, fsync_dir, parse_hex8};

pub mod lease;
pub mod stream;

pub use lease::{Cancel, ReadySignal};

pub const ID_FILE: &str = "id";
pub const LOCK_FILE: &str = "LOCK";
pub const DBS_DIR: &str = "dbs";

/// Длина идентификатора узла (hex-символы).
pub const NODE_ID_LEN: usize = 24;

/// Зарезервированные суффиксы имён баз.
pub const RESERVED_SUFFIXES: [&str; 4] = ["-journal", "-wal", "-shm", "-pos"];

struct StoreInner {
    by_id: HashMap<u32, Arc<Db>>,
    by_name: HashMap<String, Arc<Db>>,
    next_id: u32,
}

pub struct Store {
    path: PathBuf,
    node_id: String,
    cfg: Config,
    leaser: Option<Arc<dyn Leaser>>,
    client: Option<Arc<dyn Client>>,
    invalidator: InvalidatorSlot,

    inner: Mutex<StoreInner>,
    primary: AtomicBool,
    primary_cancels: Mutex<Vec<Weak<Cancel>>>,
    pub(crate) ready: ReadySignal,
    pub(crate) closing: Arc<Cancel>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,

    _lock: File, // эксклюзивный LOCK (fs2); освобождается на Drop
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Открыть Store: создать корень при отсутствии, взять LOCK, прочитать
    /// или породить идентификатор узла, восстановить все базы, запустить
    /// фоновые потоки (монитор аренды, компактация лога).
    pub fn open(
        path: impl Into<PathBuf>,
        cfg: Config,
        leaser: Option<Arc<dyn Leaser>>,
        client: Option<Arc<dyn Client>>,
    ) -> Result<Arc<Self>> {
        let path = path.into();
        fs::create_dir_all(&path).with_context(|| format!("create root {}", path.display()))?;

        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.join(LOCK_FILE))
            .with_context(|| format!("open lock file {}", path.join(LOCK_FILE).display()))?;
        lock.try_lock_exclusive().map_err(|_| {
            anyhow!(Error::Busy).context(format!("store already open at {}", path.display()))
        })?;

        let node_id = read_or_create_node_id(&path)?;

        let store = Arc::new(Self {
            path: path.clone(),
            node_id,
            cfg,
            leaser,
            client,
            invalidator: Arc::new(Mutex::new(None)),
            inner: Mutex::new(StoreInner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                next_id: 1,
            }),
            primary: AtomicBool::new(false),
            primary_cancels: Mutex::new(Vec::new()),
            ready: ReadySignal::new(),
            closing: Cancel::new(),
            threads: Mutex::new(Vec::new()),
            _lock: lock,
        });

        store.scan_databases()?;
        Self::spawn_background(&store);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Идентификатор узла (рождается при первом открытии, живёт вечно).
    pub fn id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn leaser(&self) -> Option<Arc<dyn Leaser>> {
        self.leaser.clone()
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn Client>> {
        self.client.clone()
    }

    /// Установить инвалидатор кэша ядра (поверхность ФС после монтирования).
    pub fn set_invalidator(&self, inv: Option<Arc<dyn Invalidator>>) {
        *self.invalidator.lock().unwrap() = inv;
    }

    // -------- базы --------

    fn dbs_path(&self) -> PathBuf {
        self.path.join(DBS_DIR)
    }

    /// Открыть все существующие базы в порядке их идентификаторов.
    fn scan_databases(&self) -> Result<()> {
        let dbs_dir = self.dbs_path();
        fs::create_dir_all(&dbs_dir)
            .with_context(|| format!("create {}", dbs_dir.display()))?;

        let mut ids: Vec<u32> = Vec::new();
        for ent in fs::read_dir(&dbs_dir)? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(id) = parse_hex8(&name.to_string_lossy()) else {
                log::warn!("store: skipping unrecognized entry {:?} in dbs/", name);
                continue;
            };
            ids.push(id);
        }
        ids.sort_unstable();

        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            let dir = dbs_dir.join(format_hex8(id));
            let name_raw = fs::read(dir.join(FILE_NAME))
                .with_context(|| format!("read {}", dir.join(FILE_NAME).display()))?;
            let name = String::from_utf8(name_raw)
                .map_err(|_| anyhow!(Error::Invalid).context("db name is not utf-8"))?;

            let db = Arc::new(Db::new(
                id,
                name.clone(),
                dir,
                self.cfg.data_fsync,
                self.invalidator.clone(),
            ));
            db.recover()
                .with_context(|| format!("recover db {} ({:?})", id, name))?;

            inner.by_id.insert(id, db.clone());
            inner.by_name.insert(name, db);
            inner.next_id = inner.next_id.max(id + 1);
        }
        log::info!(
            "store: opened {} database(s) at {}",
            inner.by_id.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Создать новую базу. Имя не может нести зарезервированный суффикс.
    pub fn create_db(&self, name: &str) -> Result<Arc<Db>> {
        validate_db_name(name)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.by_name.contains_key(name) {
            return Err(anyhow!(Error::Exists).context(format!("database {:?}", name)));
        }
        let id = inner.next_id;

        let dir = self.dbs_path().join(format_hex8(id));
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        fs::write(dir.join(FILE_NAME), name.as_bytes())
            .with_context(|| format!("write {}", dir.join(FILE_NAME).display()))?;
        File::create(dir.join(FILE_DATABASE))
            .with_context(|| format!("create {}", dir.join(FILE_DATABASE).display()))?;
        let _ = fsync_dir(&dir.join(FILE_NAME));

        let db = Arc::new(Db::new(
            id,
            name.to_string(),
            dir,
            self.cfg.data_fsync,
            self.invalidator.clone(),
        ));
        inner.next_id = id + 1;
        inner.by_id.insert(id, db.clone());
        inner.by_name.insert(name.to_string(), db.clone());
        log::info!("store: created database {:?} (id={})", name, id);
        Ok(db)
    }

    pub fn find_db(&self, id: u32) -> Option<Arc<Db>> {
        self.inner.lock().unwrap().by_id.get(&id).cloned()
    }

    pub fn find_db_by_name(&self, name: &str) -> Option<Arc<Db>> {
        self.inner.lock().unwrap().by_name.get(name).cloned()
    }

    pub fn list_dbs(&self) -> Vec<Arc<Db>> {
        self.inner.lock().unwrap().by_id.values().cloned().collect()
    }

    /// Удалить базу (не экспонируется через поверхность ФС).
    pub fn drop_db(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(db) = inner.by_name.remove(name) else {
            return Err(anyhow!(Error::NotFound).context(format!("database {:?}", name)));
        };
        inner.by_id.remove(&db.id());
        drop(inner);
        fs::remove_dir_all(db.path())
            .with_context(|| format!("remove {}", db.path().display()))?;
        log::info!("store: dropped database {:?} (id={})", name, db.id());
        Ok(())
    }

    /// Позиции всех баз (для запроса стрима у primary).
    pub fn pos_map(&self) -> HashMap<u32, Pos> {
        self.list_dbs().iter().map(|db| (db.id(), db.pos())).collect()
    }

    /// Стримить снапшот базы в писатель.
    pub fn write_snapshot_to<W: std::io::Write>(&self, db: &Db, w: &mut W) -> Result<Pos> {
        db.write_snapshot_to(w)
    }

    /// Заменить состояние базы снапшотом из читателя.
    pub fn import<R: std::io::Read>(&self, db: &Db, r: &mut R) -> Result<Pos> {
        db.import(r)
    }

    // -------- primary-статус --------

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    pub(crate) fn set_primary(&self, on: bool) {
        self.primary.store(on, Ordering::SeqCst);
    }

    /// Контекст primary-статуса: дочерний токен родителя, срабатывающий
    /// при потере аренды. Если узел не primary — токен рождается
    /// отменённым.
    pub fn primary_ctx(&self, parent: Option<&Arc<Cancel>>) -> Arc<Cancel> {
        let token = match parent {
            Some(p) => p.child(),
            None => Cancel::new(),
        };
        if !self.is_primary() {
            token.cancel();
            return token;
        }
        self.primary_cancels
            .lock()
            .unwrap()
            .push(Arc::downgrade(&token));
        token
    }

    pub(crate) fn trip_primary_ctxs(&self) {
        let tokens = std::mem::take(&mut *self.primary_cancels.lock().unwrap());
        for w in tokens {
            if let Some(t) = w.upgrade() {
                t.cancel();
            }
        }
    }

    /// Дождаться первого ответа арендодателя.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.ready.wait(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    // -------- фоновые потоки и закрытие --------

    fn spawn_background(store: &Arc<Self>) {
        let mut threads = store.threads.lock().unwrap();

        let monitor = {
            let store = store.clone();
            std::thread::Builder::new()
                .name("qfs-lease".into())
                .spawn(move || store.lease_monitor_loop())
                .expect("spawn lease monitor")
        };
        threads.push(monitor);

        if store.cfg.compact_interval_secs > 0 && store.cfg.retain_ltx > 0 {
            let store = store.clone();
            let h = std::thread::Builder::new()
                .name("qfs-compact".into())
                .spawn(move || store.compaction_loop())
                .expect("spawn compaction thread");
            threads.push(h);
        }
    }

    fn compaction_loop(&self) {
        let interval = Duration::from_secs(self.cfg.compact_interval_secs);
        loop {
            if self.closing.sleep(interval) {
                return;
            }
            for db in self.list_dbs() {
                match ltxdir::compact(&db.ltx_dir(), self.cfg.retain_ltx) {
                    Ok(true) => log::debug!("store: compacted ltx log of db {}", db.id()),
                    Ok(false) => {}
                    Err(e) => log::warn!("store: compaction of db {} failed: {:#}", db.id(), e),
                }
            }
        }
    }

    /// Закрыть Store: остановить фоновые потоки и дождаться их.
    pub fn close(&self) -> Result<()> {
        self.closing.cancel();
        self.trip_primary_ctxs();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in threads {
            let _ = h.join();
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.closing.cancel();
        // fs2-блокировка снимется вместе с дескриптором _lock.
    }
}

/// Проверка имени базы: без разделителей пути и зарезервированных
/// суффиксов видимых файлов.
pub fn validate_db_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(anyhow!(Error::Invalid).context(format!("bad database name {:?}", name)));
    }
    for suffix in RESERVED_SUFFIXES {
        if name.ends_with(suffix) {
            return Err(anyhow!(Error::Invalid)
                .context(format!("database name {:?} carries reserved suffix {}", name, suffix)));
        }
    }
    Ok(())
}

fn read_or_create_node_id(root: &Path) -> Result<String> {
    let path = root.join(ID_FILE);
    match fs::read_to_string(&path) {
        Ok(s) => {
            let s = s.trim().to_string();
            if s.len() != NODE_ID_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(anyhow!(Error::Invalid)
                    .context(format!("malformed node id in {}", path.display())));
            }
            Ok(s)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut raw = [0u8; NODE_ID_LEN / 2];
            rand::thread_rng().fill_bytes(&mut raw);
            let id: String = raw.iter().map(|b| format!("{:02X}", b)).collect();

            // tmp+rename: идентификатор либо есть целиком, либо нет
            let tmp = root.join(format!("{}.tmp", ID_FILE));
            fs::write(&tmp, format!("{}\n", id))
                .with_context(|| format!("write {}", tmp.display()))?;
            fs::rename(&tmp, &path)
                .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
            let _ = fsync_dir(&path);
            Ok(id)
        }
        Err(e) => Err(anyhow!(e).context(format!("read {}", path.display()))),
    }
}
