//! Upgradable reader/writer lock for populate-once allocations
//!
//! Built from two binary permits plus a reader count. The first reader takes
//! the write permit on behalf of every reader and the last reader gives it
//! back. A loader can therefore take the write permit on one thread, hand it
//! to the thread that completes population, and have every reader block until
//! that thread releases it. Neither permit is tied to the thread that took it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

struct PermitState {
    available: usize,
    /// Bumped by `interrupt`; a waiter that sees it change gives up
    epoch: u64,
    /// Set by `abandon`; every wait from then on gives up
    abandoned: bool,
}

/// Counting permit set that does not track ownership
struct Permits {
    max: usize,
    state: Mutex<PermitState>,
    available: Condvar,
}

impl Permits {
    fn new(max: usize) -> Self {
        Self {
            max,
            state: Mutex::new(PermitState {
                available: max,
                epoch: 0,
                abandoned: false,
            }),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        loop {
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            if state.epoch != epoch || state.abandoned {
                return Err(Error::LockInterrupted);
            }
            self.available.wait(&mut state);
        }
    }

    fn acquire_uninterruptibly(&self) {
        let mut state = self.state.lock();
        while state.available == 0 {
            self.available.wait(&mut state);
        }
        state.available -= 1;
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.available >= self.max {
            tracing::error!(max = self.max, "Released a permit that was not held");
            return;
        }
        state.available += 1;
        self.available.notify_one();
    }

    fn interrupt(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        self.available.notify_all();
    }

    fn abandon(&self) {
        let mut state = self.state.lock();
        state.abandoned = true;
        self.available.notify_all();
    }

    fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    fn available(&self) -> usize {
        self.state.lock().available
    }
}

/// Reader-biased upgradable lock; see the module docs
pub struct GateLock {
    read_gate: Permits,
    write_gate: Permits,
    /// Only read or written while `read_gate` is held
    readers: AtomicUsize,
}

impl Default for GateLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GateLock {
    pub fn new() -> Self {
        Self {
            read_gate: Permits::new(1),
            write_gate: Permits::new(1),
            readers: AtomicUsize::new(0),
        }
    }

    /// Take a shared lock, blocking while a writer holds the gate.
    ///
    /// On failure every permit taken by this call has been given back.
    pub fn read_lock(&self) -> Result<()> {
        self.read_gate.acquire()?;

        if self.readers.load(Ordering::Acquire) == 0 {
            if let Err(e) = self.write_gate.acquire() {
                self.read_gate.release();
                return Err(e);
            }
        }

        self.readers.fetch_add(1, Ordering::AcqRel);
        self.read_gate.release();
        Ok(())
    }

    /// Release a shared lock taken with [`GateLock::read_lock`]
    pub fn read_unlock(&self) {
        self.read_gate.acquire_uninterruptibly();

        let readers = self.readers.load(Ordering::Acquire);
        if readers == 0 {
            tracing::error!("read_unlock called with no active readers");
        } else {
            self.readers.store(readers - 1, Ordering::Release);
            if readers == 1 {
                self.write_gate.release();
            }
        }

        self.read_gate.release();
    }

    /// Take the exclusive lock, blocking until no reader and no writer holds it
    pub fn write_lock(&self) -> Result<()> {
        self.write_gate.acquire()
    }

    /// Like [`GateLock::write_lock`] but cannot be interrupted
    pub fn write_lock_uninterruptibly(&self) {
        self.write_gate.acquire_uninterruptibly()
    }

    /// Take the exclusive lock only if it is free right now
    pub fn try_write_lock(&self) -> bool {
        self.write_gate.try_acquire()
    }

    /// Release the exclusive lock; may be called from any thread
    pub fn write_unlock(&self) {
        self.write_gate.release();
    }

    /// Wake every thread currently blocked on this lock with
    /// [`Error::LockInterrupted`]. Held locks are unaffected.
    pub fn interrupt(&self) {
        self.read_gate.interrupt();
        self.write_gate.interrupt();
    }

    /// Like [`GateLock::interrupt`], but also fails every later wait.
    ///
    /// A free permit can still be taken and held permits are still released
    /// normally; only blocking is refused. Used when the owner of the lock is
    /// going away and nobody should wait on it any more.
    pub fn abandon(&self) {
        self.read_gate.abandon();
        self.write_gate.abandon();
    }

    pub fn is_abandoned(&self) -> bool {
        self.write_gate.is_abandoned()
    }

    /// Number of active readers
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Whether the write permit is currently taken, by a writer or by readers
    pub fn is_gated(&self) -> bool {
        self.write_gate.available() == 0
    }

    /// RAII form of [`GateLock::read_lock`]
    pub fn read(&self) -> Result<GateReadGuard<'_>> {
        self.read_lock()?;
        Ok(GateReadGuard { lock: self })
    }

    /// RAII form of [`GateLock::write_lock`]
    pub fn write(&self) -> Result<GateWriteGuard<'_>> {
        self.write_lock()?;
        Ok(GateWriteGuard { lock: self })
    }

    /// Take the exclusive lock as an owned permit that can move to another thread
    pub fn write_owned(self: &Arc<Self>) -> Result<WritePermit> {
        self.write_lock()?;
        Ok(WritePermit { lock: self.clone() })
    }
}

/// Shared lock on a [`GateLock`]; released on drop
pub struct GateReadGuard<'a> {
    lock: &'a GateLock,
}

impl Drop for GateReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive lock on a [`GateLock`]; released on drop
pub struct GateWriteGuard<'a> {
    lock: &'a GateLock,
}

impl Drop for GateWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

/// Owned exclusive lock. Dropping it, on any thread, releases the lock.
pub struct WritePermit {
    lock: Arc<GateLock>,
}

impl WritePermit {
    /// Release the lock now
    pub fn release(self) {}
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

impl std::fmt::Debug for WritePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_millis(100);

    #[test]
    fn test_writer_excluded_while_readers_active() {
        let lock = GateLock::new();

        lock.read_lock().unwrap();
        lock.read_lock().unwrap();
        assert_eq!(lock.readers(), 2);
        assert!(!lock.try_write_lock());

        lock.read_unlock();
        assert!(!lock.try_write_lock());

        lock.read_unlock();
        assert_eq!(lock.readers(), 0);
        assert!(lock.try_write_lock());
        lock.write_unlock();
    }

    #[test]
    fn test_blocked_writer_proceeds_when_last_reader_leaves() {
        let lock = Arc::new(GateLock::new());
        lock.read_lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.write_lock().unwrap();
                tx.send(()).unwrap();
                lock.write_unlock();
            })
        };

        assert!(rx.recv_timeout(SETTLE).is_err());
        lock.read_unlock();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_readers_wait_for_population() {
        let lock = Arc::new(GateLock::new());
        let permit = lock.write_owned().unwrap();

        let (tx, rx) = mpsc::channel();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let lock = lock.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let _guard = lock.read().unwrap();
                    tx.send(()).unwrap();
                })
            })
            .collect();

        assert!(rx.recv_timeout(SETTLE).is_err());

        // Population completes on a different thread than the one that locked
        std::thread::spawn(move || permit.release()).join().unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(lock.readers(), 0);
        assert!(!lock.is_gated());
    }

    #[test]
    fn test_interrupt_restores_permits() {
        let lock = Arc::new(GateLock::new());
        lock.write_lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                tx.send(lock.read_lock()).unwrap();
            })
        };

        assert!(rx.recv_timeout(SETTLE).is_err());
        lock.interrupt();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(Error::LockInterrupted)));
        reader.join().unwrap();

        // Interrupted reader left no trace behind
        assert_eq!(lock.readers(), 0);
        lock.write_unlock();
        let guard = lock.read().unwrap();
        assert_eq!(lock.readers(), 1);
        drop(guard);
        assert!(lock.try_write_lock());
    }

    #[test]
    fn test_abandon_fails_current_and_later_waits() {
        let lock = Arc::new(GateLock::new());
        let permit = lock.write_owned().unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                tx.send(lock.read_lock()).unwrap();
            })
        };
        assert!(rx.recv_timeout(SETTLE).is_err());

        lock.abandon();
        assert!(lock.is_abandoned());
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(Error::LockInterrupted)));
        reader.join().unwrap();

        // Waits that start after abandon() fail right away
        assert!(matches!(lock.read_lock(), Err(Error::LockInterrupted)));
        assert!(matches!(lock.write_lock(), Err(Error::LockInterrupted)));

        // Free permits are still handed out
        permit.release();
        let guard = lock.read().unwrap();
        assert_eq!(lock.readers(), 1);
        drop(guard);
        assert!(!lock.is_gated());
    }

    #[test]
    fn test_unbalanced_unlocks_are_ignored() {
        let lock = GateLock::new();
        lock.read_unlock();
        lock.write_unlock();

        assert!(lock.try_write_lock());
        assert!(!lock.try_write_lock());
        lock.write_unlock();
    }
}
