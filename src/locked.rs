/*!
 * Mutex-Based Memoization Cell
 * Blocking baseline kept for benchmark comparison
 */

use parking_lot::Mutex;
use std::sync::Arc;

struct State<S, T> {
    pending: Option<S>,
    output: Option<Arc<T>>,
}

/// Coarse-grained variant of [`MemoCell`](crate::MemoCell) behind one mutex
///
/// Same publish/read surface and the same coalescing behavior, but every
/// operation serializes on the lock: a reader holding the mutex through a
/// slow transform stalls all publishers and all other readers. That is a
/// deliberate deviation from the lock-free contract, kept only as the
/// baseline the comparison benchmark measures against. Reach for
/// [`MemoCell`](crate::MemoCell) in real code.
pub struct LockedMemoCell<S, T, F> {
    transform: F,
    state: Mutex<State<S, T>>,
}

impl<S, T, F> LockedMemoCell<S, T, F>
where
    F: Fn(S) -> T,
{
    /// Create a new cell around a pure transform
    #[inline]
    pub fn new(transform: F) -> Self {
        Self {
            transform,
            state: Mutex::new(State {
                pending: None,
                output: None,
            }),
        }
    }

    /// Publish a new input, replacing any unconsumed one
    #[inline]
    pub fn publish(&self, input: S) {
        self.state.lock().pending = Some(input);
    }

    /// Read the current output, computing a pending input under the lock
    ///
    /// Returns `None` only before the first completed computation. The lock
    /// is not poisoned, so a panicking transform leaves the previous output
    /// intact here as well.
    pub fn read(&self) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        if let Some(input) = state.pending.take() {
            state.output = Some(Arc::new((self.transform)(input)));
        }
        state.output.clone()
    }

    /// Current output without attempting any computation
    #[inline]
    pub fn latest(&self) -> Option<Arc<T>> {
        self.state.lock().output.clone()
    }
}
