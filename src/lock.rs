//! Per-node recursive reader/writer lock and scoped multi-node acquisition.
//!
//! Each node carries one [`RecursiveRwLock`]. It provides the logical
//! exclusion between the render path (readers) and structural edits
//! (writers); the data it protects sits behind its own short-lived
//! `parking_lot` locks.
//!
//! Rules, per thread:
//! * a write lock may be re-entered any number of times;
//! * a read lock may be re-entered any number of times;
//! * requesting a read lock while holding the write lock is misuse and panics
//!   with `LockMisuseError`;
//! * requesting the write lock while holding a read lock upgrades, once this
//!   thread is the only reader left. Two threads upgrading the same lock at
//!   once is misuse and panics with `LockMisuseError`.
//!
//! Readers arriving for the first time yield to waiting writers, so a steady
//! render loop cannot starve the control thread.
//!
//! [`LockGuard::acquire`] never blocks while holding a lock it took itself:
//! when a lock is busy it releases what it took so far, waits for the busy
//! lock alone, and starts over. Only locks held by an enclosing guard stay
//! held across a wait, so a render cannot wedge a thread that upgrades a
//! dependency under [`Graph::lock`](crate::graph::Graph::lock).

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Which side of a [`RecursiveRwLock`] to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
}

#[derive(Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_depth: usize,
    readers: Vec<(ThreadId, usize)>,
    writers_waiting: usize,
    upgrading: Option<ThreadId>,
}

impl LockState {
    fn read_depth(&self, thread: ThreadId) -> usize {
        self.readers
            .iter()
            .find(|(t, _)| *t == thread)
            .map_or(0, |(_, depth)| *depth)
    }

    fn only_reader_is(&self, thread: ThreadId) -> bool {
        self.readers.iter().all(|(t, _)| *t == thread)
    }

    fn read_available(&self) -> bool {
        self.writer.is_none() && self.writers_waiting == 0
    }

    fn write_available(&self, thread: ThreadId) -> bool {
        self.writer.is_none() && self.only_reader_is(thread)
    }
}

/// A reader/writer lock that tracks re-entry per thread.
#[derive(Default)]
pub struct RecursiveRwLock {
    state: Mutex<LockState>,
    released: Condvar,
}

#[cold]
fn misuse(message: &str) -> ! {
    tracing::error!("LockMisuseError: {}", message);
    panic!("LockMisuseError: {}", message);
}

impl RecursiveRwLock {
    /// An unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the shared side, blocking while another thread writes.
    ///
    /// # Panics
    /// If the calling thread holds the write side.
    pub fn lock_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            drop(state);
            misuse("read lock requested while holding the write lock");
        }
        if let Some(entry) = state.readers.iter_mut().find(|(t, _)| *t == me) {
            entry.1 += 1;
            return;
        }
        while state.writer.is_some() || state.writers_waiting > 0 {
            self.released.wait(&mut state);
        }
        state.readers.push((me, 1));
    }

    /// Release one level of the shared side.
    pub fn unlock_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let Some(pos) = state.readers.iter().position(|(t, _)| *t == me) else {
            drop(state);
            misuse("read unlock without a matching read lock");
        };
        state.readers[pos].1 -= 1;
        if state.readers[pos].1 == 0 {
            state.readers.swap_remove(pos);
            self.released.notify_all();
        }
    }

    /// Take the exclusive side, blocking while any other thread holds
    /// either side.
    pub fn lock_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return;
        }
        let upgrading = state.read_depth(me) > 0;
        if upgrading {
            if state.upgrading.is_some_and(|other| other != me) {
                drop(state);
                misuse("two threads upgrading the same read lock");
            }
            state.upgrading = Some(me);
        }
        state.writers_waiting += 1;
        while !state.write_available(me) {
            self.released.wait(&mut state);
        }
        state.writers_waiting -= 1;
        if upgrading {
            state.upgrading = None;
        }
        state.writer = Some(me);
        state.write_depth = 1;
    }

    /// Take the shared side if that needs no wait.
    ///
    /// # Panics
    /// If the calling thread holds the write side.
    pub fn try_lock_read(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            drop(state);
            misuse("read lock requested while holding the write lock");
        }
        if let Some(entry) = state.readers.iter_mut().find(|(t, _)| *t == me) {
            entry.1 += 1;
            return true;
        }
        if !state.read_available() {
            return false;
        }
        state.readers.push((me, 1));
        true
    }

    /// Take the exclusive side if that needs no wait.
    pub fn try_lock_write(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return true;
        }
        if !state.write_available(me) {
            return false;
        }
        state.writer = Some(me);
        state.write_depth = 1;
        true
    }

    /// Release one level of the exclusive side.
    pub fn unlock_write(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer != Some(me) {
            drop(state);
            misuse("write unlock by a thread that does not hold the write lock");
        }
        state.write_depth -= 1;
        if state.write_depth == 0 {
            state.writer = None;
            self.released.notify_all();
        }
    }

    /// Take one side.
    pub fn lock(&self, access: Access) {
        match access {
            Access::Read => self.lock_read(),
            Access::Write => self.lock_write(),
        }
    }

    /// Take one side if that needs no wait.
    pub fn try_lock(&self, access: Access) -> bool {
        match access {
            Access::Read => self.try_lock_read(),
            Access::Write => self.try_lock_write(),
        }
    }

    /// Release one side.
    pub fn unlock(&self, access: Access) {
        match access {
            Access::Read => self.unlock_read(),
            Access::Write => self.unlock_write(),
        }
    }

    /// True if the calling thread holds the write side.
    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Re-entry depth of the calling thread's write side.
    pub fn write_depth(&self) -> usize {
        let state = self.state.lock();
        if state.writer == Some(thread::current().id()) {
            state.write_depth
        } else {
            0
        }
    }

    /// Re-entry depth of the calling thread's read side.
    pub fn read_depth(&self) -> usize {
        self.state.lock().read_depth(thread::current().id())
    }

    /// Number of threads holding the shared side.
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// True if any thread holds either side.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }
}

impl fmt::Debug for RecursiveRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RecursiveRwLock")
            .field("writer", &state.writer)
            .field("write_depth", &state.write_depth)
            .field("readers", &state.readers.len())
            .field("writers_waiting", &state.writers_waiting)
            .field("upgrading", &state.upgrading)
            .finish()
    }
}

/// A set of held node locks, released in reverse acquisition order on drop,
/// including during unwinding.
///
/// The guard is tied to the acquiring thread.
#[must_use = "locks are released as soon as the guard is dropped"]
pub struct LockGuard {
    held: Vec<(Arc<RecursiveRwLock>, Access)>,
    _not_send: PhantomData<*const ()>,
}

impl LockGuard {
    /// Acquire every lock, taking them in the given order.
    ///
    /// A busy lock makes the call release everything it took, block on that
    /// lock alone, and retry with it held. The order only decides who waits,
    /// never whether two callers can wait on each other.
    pub fn acquire(locks: Vec<(Arc<RecursiveRwLock>, Access)>) -> Self {
        let mut pinned: Option<usize> = None;
        loop {
            let mut guard = Self {
                held: Vec::with_capacity(locks.len()),
                _not_send: PhantomData,
            };
            if let Some(index) = pinned {
                guard.held.push(locks[index].clone());
            }
            let mut busy = None;
            for (index, (lock, access)) in locks.iter().enumerate() {
                if pinned == Some(index) {
                    continue;
                }
                if !lock.try_lock(*access) {
                    busy = Some(index);
                    break;
                }
                guard.held.push((lock.clone(), *access));
            }
            let Some(index) = busy else {
                return guard;
            };
            drop(guard);
            let (lock, access) = &locks[index];
            lock.lock(*access);
            pinned = Some(index);
        }
    }

    /// Number of locks held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        while let Some((lock, access)) = self.held.pop() {
            lock.unlock(access);
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("held", &self.held.len()).finish()
    }
}
