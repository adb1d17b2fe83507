//! db/locks — именованные advisory-блокировки базы (pending/reserved/shared).
//!
//! Движок берёт байтовые блокировки на трёх зарезервированных смещениях
//! файла базы; ядерные POSIX-локи для его семантики недостаточны, поэтому
//! таблица живёт целиком в памяти под мьютексом базы. Каждый файловый
//! хэндл несёт собственный уровень по каждой блокировке; таблица хранит
//! агрегат {excl, shared_n}.
//!
//! Многодиапазонный запрос (несколько именованных блокировок за один
//! setlk) применяется атомарно: сначала проверяются все переходы, затем
//! все выполняются.

/// Агрегатное состояние одной именованной блокировки.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbLock {
    pub excl: bool,
    pub shared_n: u32,
}

/// Имя блокировки (порядок фиксирован и используется при переборе).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockName {
    Pending,
    Reserved,
    Shared,
}

pub const LOCK_NAMES: [LockName; 3] = [LockName::Pending, LockName::Reserved, LockName::Shared];

/// Уровень, который конкретный хэндл держит по блокировке.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockLevel {
    #[default]
    Unlocked,
    Read,
    Write,
}

/// Таблица трёх именованных блокировок базы.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockTable {
    pub pending: DbLock,
    pub reserved: DbLock,
    pub shared: DbLock,
}

impl LockTable {
    #[inline]
    pub fn get(&self, name: LockName) -> &DbLock {
        match name {
            LockName::Pending => &self.pending,
            LockName::Reserved => &self.reserved,
            LockName::Shared => &self.shared,
        }
    }

    #[inline]
    fn get_mut(&mut self, name: LockName) -> &mut DbLock {
        match name {
            LockName::Pending => &mut self.pending,
            LockName::Reserved => &mut self.reserved,
            LockName::Shared => &mut self.shared,
        }
    }

    /// Проверить, что все переходы хэндла на уровень `to` возможны.
    pub fn can_set(&self, held: &HandleLockState, to: LockLevel, names: &[LockName]) -> bool {
        names
            .iter()
            .all(|&n| can_transition(self.get(n), held.get(n), to))
    }

    /// Атомарно выполнить переходы (после успешного can_set).
    /// Возвращает false (ничего не меняя), если хотя бы один невозможен.
    pub fn try_set(
        &mut self,
        held: &mut HandleLockState,
        to: LockLevel,
        names: &[LockName],
    ) -> bool {
        if !self.can_set(held, to, names) {
            return false;
        }
        for &n in names {
            let from = held.get(n);
            apply_transition(self.get_mut(n), from, to);
            held.set(n, to);
        }
        true
    }

    /// Снять всё, что держит хэндл (закрытие дескриптора).
    pub fn release_all(&mut self, held: &mut HandleLockState) {
        for n in LOCK_NAMES {
            let from = held.get(n);
            if from != LockLevel::Unlocked {
                apply_transition(self.get_mut(n), from, LockLevel::Unlocked);
                held.set(n, LockLevel::Unlocked);
            }
        }
    }
}

/// Уровни одного хэндла по трём блокировкам.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandleLockState {
    pending: LockLevel,
    reserved: LockLevel,
    shared: LockLevel,
}

impl HandleLockState {
    #[inline]
    pub fn get(&self, name: LockName) -> LockLevel {
        match name {
            LockName::Pending => self.pending,
            LockName::Reserved => self.reserved,
            LockName::Shared => self.shared,
        }
    }

    #[inline]
    fn set(&mut self, name: LockName, level: LockLevel) {
        match name {
            LockName::Pending => self.pending = level,
            LockName::Reserved => self.reserved = level,
            LockName::Shared => self.shared = level,
        }
    }

    /// Держит ли хэндл хоть что-нибудь.
    pub fn holds_any(&self) -> bool {
        LOCK_NAMES.iter().any(|&n| self.get(n) != LockLevel::Unlocked)
    }
}

/// Матрица переходов для одного хэндла.
pub fn can_transition(lock: &DbLock, from: LockLevel, to: LockLevel) -> bool {
    use LockLevel::*;
    match to {
        Read => match from {
            Unlocked => !lock.excl,
            Read => true,
            Write => true, // даунгрейд своего write-лока
        },
        Write => match from {
            Unlocked => !lock.excl && lock.shared_n == 0,
            Read => lock.shared_n == 1, // апгрейд единственного читателя
            Write => true,
        },
        Unlocked => true,
    }
}

/// Выполнить переход (вызывается только после can_transition).
pub fn apply_transition(lock: &mut DbLock, from: LockLevel, to: LockLevel) {
    use LockLevel::*;
    match (from, to) {
        (Unlocked, Read) => lock.shared_n += 1,
        (Write, Read) => {
            lock.excl = false;
            lock.shared_n += 1;
        }
        (Unlocked, Write) => lock.excl = true,
        (Read, Write) => {
            lock.excl = true;
            lock.shared_n = 0;
        }
        (Read, Unlocked) => lock.shared_n -= 1,
        (Write, Unlocked) => lock.excl = false,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockLevel::*;
    use LockName::*;

    #[test]
    fn shared_then_upgrade_conflict() {
        let mut table = LockTable::default();
        let mut h1 = HandleLockState::default();
        let mut h2 = HandleLockState::default();

        assert!(table.try_set(&mut h1, Read, &[Shared]));
        assert!(table.try_set(&mut h2, Read, &[Shared]));
        assert_eq!(table.shared.shared_n, 2);

        // апгрейд при втором читателе невозможен
        assert!(!table.try_set(&mut h1, Write, &[Shared]));

        // второй отпустил — апгрейд проходит
        assert!(table.try_set(&mut h2, Unlocked, &[Shared]));
        assert!(table.try_set(&mut h1, Write, &[Shared]));
        assert!(table.shared.excl);
        assert_eq!(table.shared.shared_n, 0);
    }

    #[test]
    fn write_downgrade_releases_excl() {
        let mut table = LockTable::default();
        let mut h = HandleLockState::default();
        assert!(table.try_set(&mut h, Write, &[Reserved]));
        assert!(table.reserved.excl);
        assert!(table.try_set(&mut h, Read, &[Reserved]));
        assert!(!table.reserved.excl);
        assert_eq!(table.reserved.shared_n, 1);
    }

    #[test]
    fn multi_lock_request_is_atomic() {
        let mut table = LockTable::default();
        let mut writer = HandleLockState::default();
        let mut other = HandleLockState::default();

        // чужой write на shared блокирует весь составной запрос
        assert!(table.try_set(&mut other, Write, &[Shared]));
        assert!(!table.try_set(&mut writer, Write, &[Pending, Reserved, Shared]));
        // pending/reserved не тронуты частично
        assert!(!table.pending.excl);
        assert!(!table.reserved.excl);

        assert!(table.try_set(&mut other, Unlocked, &[Shared]));
        assert!(table.try_set(&mut writer, Write, &[Pending, Reserved, Shared]));
        assert!(table.pending.excl && table.reserved.excl && table.shared.excl);
    }

    #[test]
    fn release_all_clears_handle_state() {
        let mut table = LockTable::default();
        let mut h = HandleLockState::default();
        assert!(table.try_set(&mut h, Read, &[Shared]));
        assert!(table.try_set(&mut h, Write, &[Reserved]));
        assert!(h.holds_any());

        table.release_all(&mut h);
        assert!(!h.holds_any());
        assert_eq!(table.shared.shared_n, 0);
        assert!(!table.reserved.excl);
    }
}
