/*!
 * Lazy Coalescing Memoization Cell
 * Lock-free publish/read cell that computes a derived value on demand
 */

use arc_swap::ArcSwapOption;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

/// Lock-free memoization cell with coalescing inputs
///
/// Producers publish inputs; consumers read the output derived from the most
/// recently published input by an expensive pure transform. Exactly one
/// reader at a time pays the computation cost while every other thread
/// proceeds immediately with the last known-good answer.
///
/// # Performance
///
/// - **Publish**: one atomic swap plus a heap allocation (~20-40ns)
/// - **Stale read**: one relaxed load plus an atomic pointer load (~2-5ns)
/// - **Computing read**: cost of the transform itself, paid by one thread only
///
/// # Guarantees
///
/// - The transform never runs concurrently with itself
/// - Neither `publish` nor `read` ever blocks or spins
/// - Inputs published faster than they are consumed are coalesced: only the
///   newest survives, earlier ones are dropped unread
///
/// # Example
///
/// ```
/// use memocell::MemoCell;
///
/// let cell = MemoCell::new(|x: u64| x + 1);
/// assert!(cell.read().is_none());
///
/// cell.publish(5);
/// assert_eq!(cell.read().as_deref(), Some(&6));
/// // Cached from here on, the transform is not invoked again.
/// assert_eq!(cell.read().as_deref(), Some(&6));
/// ```
///
/// # When to Use
///
/// ✅ **Use when**:
/// - A slow pure derivation sits between a fast producer and many readers
/// - Readers tolerate a stale answer but must never wait
/// - Intermediate inputs may be skipped entirely
///
/// ❌ **Don't use when**:
/// - Every published input must be observed (use a queue)
/// - A reader needs the result of one specific input (use a blocking channel)
/// - Staleness must be bounded by time
pub struct MemoCell<S, T, F> {
    transform: F,
    /// Most recent unconsumed input; null encodes "nothing pending", so no
    /// value of `S` is reserved as a sentinel.
    pending: AtomicPtr<S>,
    /// Last computed result, replaced wholesale on each computation.
    output: ArcSwapOption<T>,
    busy: TryFlag,
}

impl<S, T, F> MemoCell<S, T, F>
where
    F: Fn(S) -> T,
{
    /// Create a new cell around a pure transform
    ///
    /// The transform is fixed for the cell's lifetime. It may run
    /// concurrently with stale reads of the previous output, never with
    /// another invocation of itself.
    #[inline]
    pub fn new(transform: F) -> Self {
        Self {
            transform,
            pending: AtomicPtr::new(ptr::null_mut()),
            output: ArcSwapOption::empty(),
            busy: TryFlag::new(),
        }
    }

    /// Publish a new input, replacing any unconsumed one
    ///
    /// Never blocks and never waits for an in-flight transform. A previously
    /// published input that no reader has consumed yet is dropped here.
    #[inline]
    pub fn publish(&self, input: S) {
        let fresh = Box::into_raw(Box::new(input));
        let stale = self.pending.swap(fresh, Ordering::AcqRel);
        if !stale.is_null() {
            // Safety: the swap transferred sole ownership of `stale` to this
            // thread; the slot now holds `fresh`.
            drop(unsafe { Box::from_raw(stale) });
        }
    }

    /// Read the current output, computing it first if this thread wins the race
    ///
    /// Returns `None` only before the first completed computation. If another
    /// thread is already computing, or this thread loses the single flag
    /// acquisition, the previous output is returned immediately; readers
    /// never wait on each other or on the computation.
    ///
    /// A panicking transform propagates to the caller of this particular
    /// `read`: the previous output is retained and the busy flag is released
    /// during unwind, so later publishes and reads proceed normally.
    pub fn read(&self) -> Option<Arc<T>> {
        // Relaxed is enough for the emptiness probe; only entry into the
        // critical section below carries acquire strength.
        if self.pending.load(Ordering::Relaxed).is_null() {
            return self.output.load_full();
        }
        let guard = match self.busy.try_acquire() {
            Some(guard) => guard,
            None => return self.output.load_full(),
        };
        match self.take_pending() {
            Some(input) => {
                let fresh = Arc::new((self.transform)(input));
                self.output.store(Some(Arc::clone(&fresh)));
                drop(guard);
                Some(fresh)
            }
            // The previous flag holder drained the slot between our probe
            // and the acquisition; fall back to the cached value.
            None => self.output.load_full(),
        }
    }

    /// Current output without attempting any computation
    ///
    /// The stale-read accessor: pending input stays pending.
    #[inline(always)]
    pub fn latest(&self) -> Option<Arc<T>> {
        self.output.load_full()
    }

    /// Take and clear the pending input as one indivisible step
    ///
    /// Called only while holding the busy flag, though ownership would be
    /// sound without it: each non-null pointer leaves the slot through
    /// exactly one swap.
    #[inline]
    fn take_pending(&self) -> Option<S> {
        let taken = self.pending.swap(ptr::null_mut(), Ordering::Acquire);
        if taken.is_null() {
            None
        } else {
            // Safety: see above; this thread is the unique owner of `taken`.
            Some(*unsafe { Box::from_raw(taken) })
        }
    }
}

impl<S, T, F> Drop for MemoCell<S, T, F> {
    fn drop(&mut self) {
        let leftover = *self.pending.get_mut();
        if !leftover.is_null() {
            // Safety: `&mut self` rules out concurrent swaps, so the slot's
            // pointer is still owned by the cell.
            drop(unsafe { Box::from_raw(leftover) });
        }
    }
}

// Safety: the raw pending pointer suppresses the auto traits. Published
// inputs cross threads (S: Send), readers share Arc<T> handles
// (T: Send + Sync), and the transform is invoked through &F from whichever
// thread wins the flag (F: Sync for the shared case).
unsafe impl<S: Send, T: Send + Sync, F: Send> Send for MemoCell<S, T, F> {}
unsafe impl<S: Send, T: Send + Sync, F: Sync> Sync for MemoCell<S, T, F> {}

/// Single-bit non-blocking mutual exclusion
///
/// `try_acquire` either wins the bit or reports failure; it never waits.
/// Release happens in the guard's `Drop`, which covers panics in the
/// critical section.
struct TryFlag(AtomicBool);

impl TryFlag {
    #[inline]
    const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    fn try_acquire(&self) -> Option<FlagGuard<'_>> {
        // Cheap read first so losing threads do not bounce the cache line
        // with failed writes.
        if self.0.load(Ordering::Relaxed) {
            return None;
        }
        if self.0.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(FlagGuard { flag: self })
        }
    }
}

struct FlagGuard<'a> {
    flag: &'a TryFlag,
}

impl Drop for FlagGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.flag.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_empty_before_first_publish() {
        let cell = MemoCell::new(|x: u64| x * 2);
        assert!(cell.read().is_none());
        assert!(cell.latest().is_none());

        cell.publish(21);
        assert_eq!(cell.read().as_deref(), Some(&42));
        // Never empty again once a computation has completed.
        assert_eq!(cell.read().as_deref(), Some(&42));
        assert_eq!(cell.latest().as_deref(), Some(&42));
    }

    #[test]
    fn test_computes_once_then_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = MemoCell::new({
            let calls = Arc::clone(&calls);
            move |x: u64| {
                calls.fetch_add(1, Ordering::SeqCst);
                x + 1
            }
        });

        cell.publish(5);
        assert_eq!(cell.read().as_deref(), Some(&6));
        assert_eq!(cell.read().as_deref(), Some(&6));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_coalesces_publish_burst() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = MemoCell::new({
            let calls = Arc::clone(&calls);
            move |x: u64| {
                calls.fetch_add(1, Ordering::SeqCst);
                x + 1
            }
        });

        for i in 1..=32 {
            cell.publish(i);
        }
        // Only the newest input of the burst is ever considered.
        assert_eq!(cell.read().as_deref(), Some(&33));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_latest_never_computes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cell = MemoCell::new({
            let calls = Arc::clone(&calls);
            move |x: u64| {
                calls.fetch_add(1, Ordering::SeqCst);
                x
            }
        });

        cell.publish(7);
        assert!(cell.latest().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The input is still pending and a real read picks it up.
        assert_eq!(cell.read().as_deref(), Some(&7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Payload that counts its drops, for leak checks on the pending slot.
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_overwritten_inputs_dropped_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = MemoCell::new(|_input: Tracked| 7u32);

        for _ in 0..3 {
            cell.publish(Tracked(Arc::clone(&drops)));
        }
        // Two overwritten, one consumed by the transform.
        assert_eq!(cell.read().as_deref(), Some(&7));
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        // A value still pending at teardown is freed by the cell itself.
        cell.publish(Tracked(Arc::clone(&drops)));
        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panicking_transform_releases_flag() {
        let cell = MemoCell::new(|x: u64| {
            if x == 13 {
                panic!("unlucky input");
            }
            x + 1
        });

        cell.publish(13);
        let result = catch_unwind(AssertUnwindSafe(|| cell.read()));
        assert!(result.is_err());
        // Previous output (none yet) is retained.
        assert!(cell.latest().is_none());

        // The flag must not stay held: a fresh publish still computes.
        cell.publish(5);
        assert_eq!(cell.read().as_deref(), Some(&6));
    }

    #[test]
    fn test_concurrent_publish_and_read() {
        let cell = Arc::new(MemoCell::new(|x: u64| x + 1));
        let mut handles = vec![];

        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            handles.push(thread::spawn(move || {
                let mut last = 0u64;
                for _ in 0..10_000 {
                    if let Some(value) = cell.read() {
                        assert!(*value >= last);
                        last = *value;
                    }
                }
            }));
        }

        let writer = Arc::clone(&cell);
        handles.push(thread::spawn(move || {
            for i in 0..10_000 {
                writer.publish(i);
            }
        }));

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
