//! Class-version validity set
//!
//! Holds the serials of classes and modules whose definitions are current.
//! The compiler consults it before baking an inline-cache assumption into
//! generated code. Presence means valid; entries only leave through
//! explicit removal events.
//!
//! Insertion runs on the single thread that defines types and does not take
//! the engine mutex, so the set is internally concurrent. Removal is wrapped
//! in the engine's critical section by the caller because it races with the
//! worker generating guards for in-flight compilations.

use dashmap::DashSet;
use rustc_hash::FxBuildHasher;

/// Version identifier of a class or module definition
pub type ClassSerial = u64;

/// Concurrent set of currently valid class serials
#[derive(Debug, Default)]
pub struct ClassSerialSet {
    serials: DashSet<ClassSerial, FxBuildHasher>,
}

impl ClassSerialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `serial` valid. Returns false if it already was.
    pub fn add(&self, serial: ClassSerial) -> bool {
        self.serials.insert(serial)
    }

    /// Invalidate `serial`. Returns false if it was not present.
    pub fn remove(&self, serial: ClassSerial) -> bool {
        self.serials.remove(&serial).is_some()
    }

    pub fn contains(&self, serial: ClassSerial) -> bool {
        self.serials.contains(&serial)
    }

    /// Whether every serial in `assumed` is still valid
    pub fn all_valid(&self, assumed: &[ClassSerial]) -> bool {
        assumed.iter().all(|serial| self.contains(*serial))
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    /// Sorted copy of the current serials
    pub fn snapshot(&self) -> Vec<ClassSerial> {
        let mut serials: Vec<_> = self.serials.iter().map(|s| *s).collect();
        serials.sort_unstable();
        serials
    }

    pub fn clear(&self) {
        self.serials.clear();
    }
}
