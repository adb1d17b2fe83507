// Базовые модули
pub mod config;
pub mod error;
pub mod metrics;
pub mod pos;

// Форматы движка и дельта-записей
pub mod ltx; // src/ltx/{mod,checksum,encode,decode,dir}.rs
pub mod sqlite;

// Сущности узла
pub mod db; // src/db/{mod,core,locks,journal,wal,write,apply,snapshot,open}.rs
pub mod store; // src/store/{mod,lease,stream}.rs

// Поверхность файловой системы
pub mod fuse; // src/fuse/{mod,inode,handle}.rs

// Контракты внешних коллабораторов (Leaser/Client/Invalidator)
pub mod remote;

// Утилиты (now_millis, fsync_dir, hex-идентификаторы)
pub mod util;

// Удобные реэкспорты
pub use config::Config;
pub use db::{Db, FileType};
pub use error::Error;
pub use pos::Pos;
pub use remote::{Client, Invalidator, Lease, Leaser, PrimaryInfo, StaticLeaser};
pub use store::{Cancel, Store};
