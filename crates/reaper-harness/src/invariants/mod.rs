//! Invariant checking for timer heaps.
//!
//! Invariants are structural properties that must hold after every heap
//! operation, whatever the sequence that led there. Checks run against a
//! [`HeapSnapshot`] taken from the live heap.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.assert_all(&HeapSnapshot::from_heap(&heap), "after sweep");
//! ```

mod checks;
mod snapshot;

pub use checks::{HeapOrder, LenMatchesEntries, PositionsMatchIndices, UniqueHandles};
pub use snapshot::{EntrySnapshot, HeapSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against a heap snapshot.
pub trait Invariant<I>: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, heap: &HeapSnapshot<I>) -> InvariantResult;
}

/// Set of invariants run together.
pub struct InvariantRegistry<I> {
    invariants: Vec<Box<dyn Invariant<I>>>,
}

impl<I> Default for InvariantRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> InvariantRegistry<I> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Add an invariant to the registry.
    pub fn add(&mut self, invariant: impl Invariant<I> + 'static) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, collecting every violation.
    pub fn check_all(&self, heap: &HeapSnapshot<I>) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(heap).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation found.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, heap: &HeapSnapshot<I>, context: &str) {
        if let Err(violations) = self.check_all(heap) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }
}

impl<I: Ord + std::fmt::Debug> InvariantRegistry<I> {
    /// Registry with every structural heap invariant.
    ///
    /// Includes:
    /// - [`HeapOrder`]: no child expires before its parent
    /// - [`PositionsMatchIndices`]: each entry's recorded position is its index
    /// - [`LenMatchesEntries`]: `len()` counts exactly the stored entries
    /// - [`UniqueHandles`]: no handle appears twice
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(HeapOrder);
        registry.add(PositionsMatchIndices);
        registry.add(LenMatchesEntries);
        registry.add(UniqueHandles);
        registry
    }
}
