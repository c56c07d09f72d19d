//! SQLite file lock levels
//!
//! Read-only handles only ever reach SHARED, which needs no coordination
//! because nobody can write. Handles backed by a write overlay share one
//! [`LockTable`] per open file so that connections in this process see each
//! other's RESERVED/PENDING/EXCLUSIVE locks.

use crate::core::error::LockError;
use libsqlite3_sys as ffi;
use std::os::raw::c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LockLevel {
    #[default]
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            ffi::SQLITE_LOCK_NONE => Some(LockLevel::None),
            ffi::SQLITE_LOCK_SHARED => Some(LockLevel::Shared),
            ffi::SQLITE_LOCK_RESERVED => Some(LockLevel::Reserved),
            ffi::SQLITE_LOCK_PENDING => Some(LockLevel::Pending),
            ffi::SQLITE_LOCK_EXCLUSIVE => Some(LockLevel::Exclusive),
            _ => None,
        }
    }

    pub fn as_raw(self) -> c_int {
        match self {
            LockLevel::None => ffi::SQLITE_LOCK_NONE,
            LockLevel::Shared => ffi::SQLITE_LOCK_SHARED,
            LockLevel::Reserved => ffi::SQLITE_LOCK_RESERVED,
            LockLevel::Pending => ffi::SQLITE_LOCK_PENDING,
            LockLevel::Exclusive => ffi::SQLITE_LOCK_EXCLUSIVE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LockLevel::None => "NONE",
            LockLevel::Shared => "SHARED",
            LockLevel::Reserved => "RESERVED",
            LockLevel::Pending => "PENDING",
            LockLevel::Exclusive => "EXCLUSIVE",
        }
    }
}

/// Lock state of one open file, shared by all its handles
#[derive(Debug, Default)]
pub struct LockTable {
    shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `held` to `wanted`
    ///
    /// On `Busy` while going for EXCLUSIVE the handle is left at PENDING so
    /// new readers are kept out while existing ones drain.
    pub fn acquire(&mut self, held: &mut LockLevel, wanted: LockLevel) -> Result<(), LockError> {
        if wanted <= *held {
            return Ok(());
        }

        if *held == LockLevel::None {
            if self.pending || self.exclusive {
                return Err(LockError::Busy(LockLevel::Shared.name()));
            }
            self.shared += 1;
            *held = LockLevel::Shared;
        }
        if wanted == LockLevel::Shared {
            return Ok(());
        }

        if *held == LockLevel::Shared {
            if self.reserved {
                return Err(LockError::Busy(wanted.name()));
            }
            self.reserved = true;
            *held = LockLevel::Reserved;
        }
        if wanted == LockLevel::Reserved {
            return Ok(());
        }

        self.pending = true;
        *held = LockLevel::Pending;
        if wanted == LockLevel::Pending {
            return Ok(());
        }

        if self.shared > 1 {
            return Err(LockError::Busy(LockLevel::Exclusive.name()));
        }
        self.exclusive = true;
        *held = LockLevel::Exclusive;
        Ok(())
    }

    /// Drop `held` to `to` (NONE or SHARED)
    pub fn release(&mut self, held: &mut LockLevel, to: LockLevel) {
        if to >= *held {
            return;
        }
        if *held >= LockLevel::Reserved {
            self.reserved = false;
        }
        if *held >= LockLevel::Pending {
            self.pending = false;
        }
        if *held == LockLevel::Exclusive {
            self.exclusive = false;
        }
        if to == LockLevel::None && *held >= LockLevel::Shared {
            self.shared = self.shared.saturating_sub(1);
        }
        *held = to;
    }

    /// Whether any handle holds RESERVED or above
    pub fn is_reserved(&self) -> bool {
        self.reserved || self.pending || self.exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        for raw in 0..=4 {
            assert_eq!(LockLevel::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(LockLevel::from_raw(9), None);
    }

    #[test]
    fn test_many_readers_share() {
        let mut table = LockTable::new();
        let mut a = LockLevel::None;
        let mut b = LockLevel::None;
        table.acquire(&mut a, LockLevel::Shared).unwrap();
        table.acquire(&mut b, LockLevel::Shared).unwrap();
        assert!(!table.is_reserved());
    }

    #[test]
    fn test_single_writer_reserved() {
        let mut table = LockTable::new();
        let mut a = LockLevel::None;
        let mut b = LockLevel::None;
        table.acquire(&mut a, LockLevel::Reserved).unwrap();
        table.acquire(&mut b, LockLevel::Shared).unwrap();

        assert_eq!(
            table.acquire(&mut b, LockLevel::Reserved),
            Err(LockError::Busy("RESERVED"))
        );
        assert_eq!(b, LockLevel::Shared);
        assert!(table.is_reserved());
    }

    #[test]
    fn test_exclusive_waits_for_readers() {
        let mut table = LockTable::new();
        let mut writer = LockLevel::None;
        let mut reader = LockLevel::None;
        table.acquire(&mut reader, LockLevel::Shared).unwrap();
        table.acquire(&mut writer, LockLevel::Shared).unwrap();

        assert_eq!(
            table.acquire(&mut writer, LockLevel::Exclusive),
            Err(LockError::Busy("EXCLUSIVE"))
        );
        assert_eq!(writer, LockLevel::Pending);

        // Pending keeps new readers out
        let mut late = LockLevel::None;
        assert!(table.acquire(&mut late, LockLevel::Shared).is_err());

        table.release(&mut reader, LockLevel::None);
        table.acquire(&mut writer, LockLevel::Exclusive).unwrap();
        assert_eq!(writer, LockLevel::Exclusive);

        table.release(&mut writer, LockLevel::Shared);
        assert!(!table.is_reserved());
        table.acquire(&mut late, LockLevel::Shared).unwrap();
    }
}
