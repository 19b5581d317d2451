//! Row versioning.

/// Entities persisted as mutable status rows carry a version that every
/// committed change bumps by one. Writers compare it to detect lost updates.
pub trait Versioned {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    fn version(&self) -> u64;
}
