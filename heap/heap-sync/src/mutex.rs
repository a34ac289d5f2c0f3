use crate::task::{TaskId, current_task};
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A spinlock mutex that remembers which task holds it.
///
/// One of these guards each region's node state, and one more serializes the
/// region table itself. Critical sections are short (free-list surgery, a
/// table scan), so contention is resolved by spinning rather than blocking.
///
/// Callers pick the acquisition mode per operation: [`lock`](Self::lock)
/// spins until the lock is free, [`try_lock`](Self::try_lock) makes a single
/// attempt, and [`acquire`](Self::acquire) selects between the two from a
/// caller-supplied wait decision, which is how allocation and free requests
/// carry their locking mode through the heap.
///
/// On acquisition the holder's task identity (see
/// [`current_task`](crate::current_task)) is recorded next to the lock word,
/// so diagnostics can name the task sitting on a contended region. The owner
/// word is informational only; mutual exclusion rests on the lock flag alone.
///
/// # Examples
///
/// ```
/// use heap_sync::SpinMutex;
///
/// let m = SpinMutex::new(0_u32);
///
/// {
///     let mut g = m.lock();
///     *g = 1;
/// } // guard drops, unlocking
///
/// assert_eq!(*m.lock(), 1);
/// ```
///
/// Single-attempt acquisition:
///
/// ```
/// use heap_sync::SpinMutex;
///
/// let m = SpinMutex::new(7_u32);
/// if let Some(mut g) = m.try_lock() {
///     *g += 1;
/// }
/// assert_eq!(*m.lock(), 8);
/// ```
///
/// # Concurrency & Safety
///
/// - Mutual exclusion rests on an atomic flag with acquire/release ordering.
/// - `Sync`/`Send` are implemented for `T: Send`; the protected value only
///   crosses threads through the guard while the lock is held.
/// - The lock is not fair and not reentrant; a holder that relocks
///   deadlocks itself.
pub struct SpinMutex<T> {
    /// Lock state (`false` = free, `true` = held).
    held: AtomicBool,
    /// Raw task identity of the current holder. Zero while the lock is free
    /// or when the holder registered no identity.
    owner: AtomicUsize,
    /// The protected value.
    cell: UnsafeCell<T>,
}

// Safety: mutual exclusion is enforced through `held`; the data may only
// cross threads when T is Send.
unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Creates a new unlocked mutex wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            cell: UnsafeCell::new(value),
        }
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// Because you hold `&mut self`, no other references can exist, so
    /// locking is unnecessary.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    /// Identity of the task currently holding the lock, if one is known.
    ///
    /// Returns `None` while the lock is free and when the holder registered
    /// no task identity. The answer can be stale by the time it is read;
    /// use it for diagnostics, never for synchronization.
    #[must_use]
    pub fn holder(&self) -> Option<TaskId> {
        let raw = self.owner.load(Ordering::Relaxed);
        if raw == 0 { None } else { Some(TaskId::new(raw)) }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// While spinning, [`core::hint::spin_loop`] signals the busy-wait to
    /// the processor. This never yields the current thread; it is the
    /// acquisition mode of callers that asked to wait.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        // Fast path: try once, then spin on a plain load until free.
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        self.claim()
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `Some(guard)` on success, or `None` if the lock is held
    /// elsewhere. This is the acquisition mode of non-waiting callers,
    /// which surface the contention instead of stalling on it.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.held.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(self.claim())
        }
    }

    /// Acquires in the caller's chosen mode: spin when `wait` is set,
    /// otherwise a single attempt.
    ///
    /// With `wait` the result is always `Some`.
    #[inline]
    pub fn acquire(&self, wait: bool) -> Option<MutexGuard<'_, T>> {
        if wait { Some(self.lock()) } else { self.try_lock() }
    }

    /// Records the new holder and builds the guard. Called with the lock
    /// flag freshly won.
    fn claim(&self) -> MutexGuard<'_, T> {
        self.owner.store(current_task().as_raw(), Ordering::Relaxed);
        MutexGuard { m: self }
    }
}

/// A guard that releases a [`SpinMutex`] when dropped.
///
/// Created by [`SpinMutex::lock`], [`SpinMutex::try_lock`], and
/// [`SpinMutex::acquire`]. Implements [`Deref`] and [`DerefMut`] to access
/// the protected value.
pub struct MutexGuard<'a, T> {
    m: &'a SpinMutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.m.cell.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Retire the owner record before the flag so no new holder races
        // our stale identity, then release.
        self.m.owner.store(0, Ordering::Relaxed);
        self.m.held.store(false, Ordering::Release);
    }
}
