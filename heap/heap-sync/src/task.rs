use core::sync::atomic::{AtomicUsize, Ordering};

/// Opaque identity of the task that owns an allocation.
///
/// The allocator records this in every active node so a heap dump can name
/// the owner. Nothing else consumes it; the value is whatever the platform's
/// registered source reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

impl TaskId {
    /// The identity used when no task source has been registered.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Registered task-identity source, stored as a raw function pointer.
/// Zero means "not registered".
static TASK_SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Registers the platform's task-identity source.
///
/// Typically called once during platform bring-up, before the first
/// allocation. Later registrations replace earlier ones.
pub fn set_task_source(source: fn() -> TaskId) {
    TASK_SOURCE.store(source as usize, Ordering::Release);
}

/// Returns the calling task's identity, or [`TaskId::none`] when no source
/// has been registered.
#[must_use]
pub fn current_task() -> TaskId {
    let raw = TASK_SOURCE.load(Ordering::Acquire);
    if raw == 0 {
        return TaskId::none();
    }

    // Safety: the only non-zero value ever stored is a `fn() -> TaskId`.
    let source: fn() -> TaskId = unsafe { core::mem::transmute(raw) };
    source()
}
