//! remote — контракты внешних коллабораторов ядра.
//!
//! Ядро не реализует ни выборы лидера, ни транспорт между узлами, ни
//! инвалидацию кэша ядра само по себе — оно потребляет эти способности
//! через узкие трейты. В крейте живёт только StaticLeaser (статическая
//! конфигурация primary для одноузловых развёртываний и тестов).

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, SystemTime};

use crate::error::Error;
use crate::pos::Pos;
use crate::store::lease::Cancel;

/// Сведения о текущем primary-узле кластера.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryInfo {
    pub hostname: String,
    pub advertise_url: String,
}

/// Аренда primary-статуса. Неудачный renew() означает потерю статуса.
pub trait Lease: Send + Sync + std::fmt::Debug {
    fn renew(&self) -> Result<()>;
    fn ttl(&self) -> Duration;
    fn renewed_at(&self) -> SystemTime;
    fn close(&self) -> Result<()>;
}

/// Переговоры о лидерстве.
pub trait Leaser: Send + Sync {
    /// Попытаться стать primary. Err(LeaseExpired) — primary уже есть.
    fn acquire(&self) -> Result<Box<dyn Lease>>;
    /// Кто сейчас primary (None — никого).
    fn primary_info(&self) -> Result<Option<PrimaryInfo>>;
    /// URL, по которому этот узел доступен другим.
    fn advertise_url(&self) -> String;
}

/// Транспорт логического стрима транзакций от primary к реплике.
/// Байтовый поток кадрируется store::stream.
pub trait Client: Send + Sync {
    fn stream(
        &self,
        ctx: &Cancel,
        url: &str,
        node_id: &str,
        pos: &HashMap<u32, Pos>,
    ) -> Result<Box<dyn Read + Send>>;
}

/// Инвалидация страничного кэша ядра после удалённого применения.
/// Поверхность ФС передаёт реализацию в Store при конструировании
/// (обратная ссылка моделируется capability-интерфейсом, не владением).
pub trait Invalidator: Send + Sync {
    /// len < 0 — инвалидировать до конца файла.
    fn invalidate(&self, db_id: u32, offset: i64, len: i64) -> Result<()>;
}

// -------------------- StaticLeaser --------------------

/// Статическая конфигурация лидерства: узел либо всегда primary, либо
/// всегда реплика с известным адресом primary.
pub struct StaticLeaser {
    primary: bool,
    hostname: String,
    advertise_url: String,
}

impl StaticLeaser {
    pub fn new(primary: bool, hostname: impl Into<String>, advertise_url: impl Into<String>) -> Self {
        Self {
            primary,
            hostname: hostname.into(),
            advertise_url: advertise_url.into(),
        }
    }
}

impl Leaser for StaticLeaser {
    fn acquire(&self) -> Result<Box<dyn Lease>> {
        if self.primary {
            Ok(Box::new(StaticLease {
                acquired_at: SystemTime::now(),
            }))
        } else {
            Err(anyhow!(Error::LeaseExpired).context("static leaser: node is not primary"))
        }
    }

    fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        if self.primary {
            Ok(None) // primary — это мы
        } else {
            Ok(Some(PrimaryInfo {
                hostname: self.hostname.clone(),
                advertise_url: self.advertise_url.clone(),
            }))
        }
    }

    fn advertise_url(&self) -> String {
        self.advertise_url.clone()
    }
}

#[derive(Debug)]
struct StaticLease {
    acquired_at: SystemTime,
}

impl Lease for StaticLease {
    fn renew(&self) -> Result<()> {
        Ok(())
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn renewed_at(&self) -> SystemTime {
        self.acquired_at
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
