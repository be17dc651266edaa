//! Lock discipline for the filesystem tree.
//!
//! Locks are acquired in strictly increasing [`LockLevel`] order:
//!
//! ```text
//! Site        project listing cache
//!  └─ Collection   one tree lock per collection filesystem
//!      └─ File         one data lock per file
//! ```
//!
//! [`OrderedRwLock`] wraps `parking_lot::RwLock`. With debug enforcement on,
//! each thread tracks the locks it holds and panics on re-entrant
//! acquisition or on acquiring a level at or below one already held. Debug
//! mode also yields the thread after every acquisition to shake out races.
//! Enforcement is chosen per lock at construction; there is no global
//! switch.
//!
//! Guards must never be held across an `.await`; the tree is only mutated
//! synchronously under these locks.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Position of a lock in the acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Site = 1,
    Collection = 2,
    File = 3,
}

thread_local! {
    static HELD: RefCell<Vec<(usize, LockLevel)>> = const { RefCell::new(Vec::new()) };
}

/// A reader-writer lock with an acquisition level.
pub struct OrderedRwLock<T> {
    level: LockLevel,
    debug: bool,
    inner: RwLock<T>,
}

impl<T: fmt::Debug> fmt::Debug for OrderedRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedRwLock")
            .field("level", &self.level)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl<T> OrderedRwLock<T> {
    pub fn new(level: LockLevel, debug: bool, value: T) -> Self {
        Self {
            level,
            debug,
            inner: RwLock::new(value),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Whether debug enforcement is on for this lock.
    pub fn debug(&self) -> bool {
        self.debug
    }

    fn id(&self) -> usize {
        self as *const Self as *const () as usize
    }

    fn enter(&self) -> Option<Held> {
        if !self.debug {
            return None;
        }
        let id = self.id();
        HELD.with(|held| {
            let held = held.borrow();
            if held.iter().any(|(h, _)| *h == id) {
                panic!("lock discipline: re-entrant acquisition of {:?} lock", self.level);
            }
            if let Some((_, top)) = held.iter().max_by_key(|(_, l)| *l) {
                if *top >= self.level {
                    panic!(
                        "lock discipline: acquiring {:?} lock while holding {:?} lock",
                        self.level, top
                    );
                }
            }
        });
        Some(Held {
            id,
            level: self.level,
        })
    }

    fn acquired(&self, held: &Option<Held>) {
        if let Some(h) = held {
            HELD.with(|stack| stack.borrow_mut().push((h.id, h.level)));
            std::thread::yield_now();
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        let held = self.enter();
        let guard = self.inner.read();
        self.acquired(&held);
        ReadGuard {
            guard,
            _held: held,
        }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        let held = self.enter();
        let guard = self.inner.write();
        self.acquired(&held);
        WriteGuard {
            guard,
            _held: held,
        }
    }
}

/// Marker for a lock recorded in the thread's held set.
struct Held {
    id: usize,
    level: LockLevel,
}

impl Drop for Held {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(h, _)| *h == self.id) {
                held.remove(pos);
            }
        });
    }
}

/// Shared guard. Field order matters: the lock is released before the
/// held-set entry is removed.
pub struct ReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _held: Option<Held>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive guard.
pub struct WriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _held: Option<Held>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
