//! Process-shared mutual exclusion for the table region.
//!
//! `RawTableMutex` is a single lock word that lives inside the shared
//! region, tagged with the PID of the holder. Independent processes map the
//! same word and serialize through compare-exchange; if the tagged holder
//! died while holding the lock, any waiter reclaims it. Acquisition hands
//! out a guard that releases on every exit path.

use std::hint::spin_loop;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::thread::yield_now;

const UNLOCKED: u32 = 0;

/// The in-region lock word. `repr(C)` and position-independent: the holder
/// PID is read at acquisition time, never stored beside the data, so the
/// same bytes work in every attached address space.
#[repr(C)]
pub struct RawTableMutex {
    lock: AtomicU32,
}

unsafe impl Send for RawTableMutex {}
unsafe impl Sync for RawTableMutex {}

/// Holds the lock for its scope; dropping releases.
pub struct TableLockGuard<'a> {
    mutex: &'a RawTableMutex,
    pid: u32,
}

impl Drop for TableLockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.pid);
    }
}

impl RawTableMutex {
    /// Initializes the lock word at `ptr`. Called exactly once, by the
    /// region creator, before any attacher can observe the region.
    ///
    /// # Safety
    /// `ptr` must point at `size_of::<RawTableMutex>()` writable bytes
    /// inside the mapped region.
    pub unsafe fn init_at(ptr: *mut RawTableMutex) {
        (ptr as *mut u32).write_volatile(UNLOCKED);
    }

    pub fn lock(&self) -> TableLockGuard<'_> {
        let pid = std::process::id();
        loop {
            if self
                .lock
                .compare_exchange(UNLOCKED, pid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }

            if self.try_cleanup_dead_holder() {
                continue;
            }

            for _ in 0..100 {
                spin_loop();
            }
            yield_now();
        }

        TableLockGuard { mutex: self, pid }
    }

    fn unlock(&self, pid: u32) {
        if self
            .lock
            .compare_exchange(pid, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            let current = self.lock.load(Ordering::Relaxed);
            tracing::warn!(pid, holder = current, "unlock by a process that is not the holder");
        }
    }

    /// Releases the word only if `observed` is still the recorded holder.
    /// Between observing a dead holder and releasing, another process may
    /// have reclaimed and re-acquired the lock; a plain store here would
    /// free a lock that is legitimately held.
    fn reclaim_from(&self, observed: u32) -> bool {
        self.lock
            .compare_exchange(observed, UNLOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Reclaims the lock if the recorded holder is no longer alive.
    fn try_cleanup_dead_holder(&self) -> bool {
        let holder = self.lock.load(Ordering::Acquire);
        if holder == UNLOCKED || is_process_alive(holder) {
            return false;
        }
        if self.reclaim_from(holder) {
            tracing::warn!(holder, "reclaimed lock held by dead process");
            true
        } else {
            false
        }
    }

    /// Clears an orphaned holder left over from a crashed process. Safe to
    /// call on attach, before the first acquisition.
    pub fn cleanup_orphaned_holder(&self) {
        let holder = self.lock.load(Ordering::Acquire);
        if holder != UNLOCKED && !is_process_alive(holder) && self.reclaim_from(holder) {
            tracing::info!(holder, "cleared orphaned lock holder on attach");
        }
    }

    #[cfg(test)]
    fn set_holder_for_test(&self, pid: u32) {
        self.lock.store(pid, Ordering::Release);
    }

    #[cfg(test)]
    fn holder_for_test(&self) -> u32 {
        self.lock.load(Ordering::Acquire)
    }
}

fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;

    struct SharedCounter {
        lock: RawTableMutex,
        value: UnsafeCell<u32>,
    }

    unsafe impl Sync for SharedCounter {}

    fn new_mutex() -> RawTableMutex {
        RawTableMutex {
            lock: AtomicU32::new(UNLOCKED),
        }
    }

    #[test]
    fn lock_unlock_cycle() {
        let mutex = new_mutex();
        drop(mutex.lock());
        drop(mutex.lock());
    }

    #[test]
    fn guard_drop_releases_for_other_threads() {
        let mutex = Arc::new(new_mutex());
        let held = Arc::clone(&mutex);

        let handle = thread::spawn(move || {
            let _guard = held.lock();
            thread::sleep(Duration::from_millis(100));
        });

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        let _guard = mutex.lock();
        let elapsed = start.elapsed();

        handle.join().unwrap();
        assert!(elapsed >= Duration::from_millis(40));
    }

    #[test]
    fn threads_are_mutually_excluded() {
        let shared = Arc::new(SharedCounter {
            lock: new_mutex(),
            value: UnsafeCell::new(0),
        });
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];

        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..1000 {
                    let _guard = shared.lock.lock();
                    unsafe { *shared.value.get() += 1 };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let _guard = shared.lock.lock();
        assert_eq!(unsafe { *shared.value.get() }, 4000);
    }

    #[test]
    fn dead_holder_is_reclaimed() {
        let mutex = new_mutex();
        // PID far above pid_max; kill() reports ESRCH for it.
        mutex.set_holder_for_test(i32::MAX as u32);

        let start = Instant::now();
        drop(mutex.lock());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn orphan_cleanup_on_attach_path() {
        let mutex = new_mutex();
        mutex.set_holder_for_test(i32::MAX as u32);
        mutex.cleanup_orphaned_holder();
        drop(mutex.lock());
    }

    #[test]
    fn stale_reclaim_does_not_release_a_new_holder() {
        let mutex = new_mutex();
        let dead = i32::MAX as u32;
        mutex.set_holder_for_test(dead);

        // Another process reclaims the dead holder and acquires the lock
        // between our observation and our release attempt.
        let new_holder = std::process::id();
        mutex.set_holder_for_test(new_holder);

        assert!(!mutex.reclaim_from(dead));
        assert_eq!(mutex.holder_for_test(), new_holder);
        mutex.unlock(new_holder);
    }

    #[test]
    fn live_holder_is_not_reclaimed() {
        let mutex = new_mutex();
        // Our own PID is alive, so cleanup must leave the lock in place.
        mutex.set_holder_for_test(std::process::id());
        mutex.cleanup_orphaned_holder();
        assert!(!mutex.try_cleanup_dead_holder());
        // Release so the poisoned word does not outlive the test.
        mutex.unlock(std::process::id());
    }
}
