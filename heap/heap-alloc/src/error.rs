use thiserror::Error;

/// Outcome classification for every fallible heap operation.
///
/// There are only two failure kinds. `Again` is transient: a lock could not
/// be taken on behalf of a non-waiting caller, or no region can serve the
/// request right now. `Fatal` is permanent for the operation as framed:
/// size overflow, a pointer no region contains, a double free, or metadata
/// corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The operation cannot succeed as framed.
    #[error("operation cannot succeed")]
    Fatal,

    /// Contention or transient refusal; the caller may retry.
    #[error("resource busy, try again")]
    Again,
}
