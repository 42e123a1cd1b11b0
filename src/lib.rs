/*!
 * Memocell Library
 *
 * Lazy coalescing memoization cell:
 * - Producers publish inputs without blocking; redundant inputs coalesce
 * - Consumers read the derived output, computed on demand by at most one
 *   thread while everyone else proceeds with the last known-good answer
 * - A mutex-based baseline is included for benchmark comparison only
 */

mod cell;
mod locked;

// Re-export public API
pub use cell::MemoCell;
pub use locked::LockedMemoCell;
