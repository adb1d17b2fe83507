//! store/lease — primary-контексты и фоновый монитор аренды.
//!
//! Cancel — кооперативный токен отмены с каскадом на детей (родительский
//! токен отменяет поддерево). primary_ctx Store-а выдаёт дочерний токен,
//! который срабатывает при потере аренды или отмене родителя.
//!
//! Монитор (один поток на узел) либо держит и продлевает аренду
//! (primary), либо подключается к primary и применяет стрим транзакций
//! (реплика). Сигнал готовности Store закрывается после первого же
//! ответа арендодателя.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Кооперативный токен отмены. Отмена необратима и каскадится на детей.
pub struct Cancel {
    cancelled: AtomicBool,
    children: Mutex<Vec<Weak<Cancel>>>,
}

impl Cancel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Уже отменённый токен (узел не primary на момент запроса).
    pub fn cancelled_token() -> Arc<Self> {
        let c = Self::new();
        c.cancel();
        c
    }

    /// Дочерний токен: отменяется вместе с родителем.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        let c = Self::new();
        if self.is_cancelled() {
            c.cancel();
            return c;
        }
        self.children.lock().unwrap().push(Arc::downgrade(&c));
        c
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for w in children {
            if let Some(c) = w.upgrade() {
                c.cancel();
            }
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Подождать delay, рано выходя при отмене. true — отменили.
    pub fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let step = (deadline - now).min(Duration::from_millis(50));
            std::thread::sleep(step);
        }
    }
}

/// Одноразовый сигнал «готов» (закрывается после первого ответа
/// арендодателя), с ожиданием по таймауту.
pub struct ReadySignal {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn mark(&self) {
        let mut g = self.ready.lock().unwrap();
        if !*g {
            *g = true;
            self.cv.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock().unwrap()
    }

    /// true — дождались; false — таймаут.
    pub fn wait(&self, timeout: Duration) -> bool {
        let g = self.ready.lock().unwrap();
        if *g {
            return true;
        }
        let (g, res) = self
            .cv
            .wait_timeout_while(g, timeout, |ready| !*ready)
            .unwrap();
        drop(g);
        !res.timed_out()
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------- монитор аренды --------------------

use crate::store::Store;

impl Store {
    /// Тело фонового монитора аренды. Выходит при закрытии Store.
    pub(crate) fn lease_monitor_loop(&self) {
        let backoff = Duration::from_millis(self.config().lease_backoff_ms.max(10));
        let Some(leaser) = self.leaser() else {
            // без арендодателя узел — standalone primary
            self.set_primary(true);
            self.ready.mark();
            return;
        };

        while !self.closing.is_cancelled() {
            match leaser.acquire() {
                Ok(lease) => {
                    log::info!("store: acquired lease, node is primary");
                    self.set_primary(true);
                    self.ready.mark();

                    loop {
                        let ttl = lease.ttl();
                        if self.closing.sleep(ttl / 2) {
                            let _ = lease.close();
                            self.set_primary(false);
                            self.trip_primary_ctxs();
                            return;
                        }
                        if let Err(e) = lease.renew() {
                            log::warn!("store: lease renewal failed: {:#}", e);
                            break;
                        }
                    }

                    let _ = lease.close();
                    self.set_primary(false);
                    self.trip_primary_ctxs();
                }
                Err(e) => {
                    self.set_primary(false);
                    match leaser.primary_info() {
                        Ok(Some(info)) => {
                            self.ready.mark();
                            log::info!(
                                "store: node is replica, primary at {}",
                                info.advertise_url
                            );
                            if let Err(e) = self.stream_from_primary(&info.advertise_url) {
                                log::warn!("store: replication stream ended: {:#}", e);
                            }
                        }
                        Ok(None) => {
                            // primary ещё не избран; повторим acquire
                            log::debug!("store: no primary yet ({:#})", e);
                            self.ready.mark();
                        }
                        Err(e) => {
                            log::warn!("store: primary_info failed: {:#}", e);
                        }
                    }
                }
            }

            if self.closing.sleep(backoff) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_cascades_to_children() {
        let parent = Cancel::new();
        let child = parent.child();
        let grandchild = child.child();
        assert!(!grandchild.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_is_born_cancelled() {
        let parent = Cancel::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn ready_signal_wait() {
        let sig = Arc::new(ReadySignal::new());
        assert!(!sig.wait(Duration::from_millis(10)));

        let sig2 = sig.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sig2.mark();
        });
        assert!(sig.wait(Duration::from_secs(5)));
        assert!(sig.is_ready());
        h.join().unwrap();
    }
}
