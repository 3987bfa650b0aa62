//! Per-transaction resource binding table.
//!
//! Bindings are keyed by the identity of the *underlying factory* a holder
//! wraps, never by the holder instance. Call sites obtain holder objects
//! freshly each time, so two distinct holders over the same factory must
//! resolve to the same binding.

use std::any::Any;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A resource bound into a transaction. Opaque to this crate.
pub type BoundResource = Arc<dyn Any + Send + Sync>;

/// Wrapper around a resource factory.
///
/// Implementations must hand back a clone of the same `Arc` on every call;
/// the pointed-to allocation is the canonical identity of the factory.
pub trait ResourceFactoryHolder: Send + Sync {
    /// The resource factory this holder wraps.
    fn underlying_factory(&self) -> Arc<dyn Any + Send + Sync>;
}

/// Canonical key for a binding: owns the factory `Arc` so the allocation
/// stays alive for as long as the binding does, and compares/hashes by the
/// allocation's identity rather than by value.
struct FactoryKey(Arc<dyn Any + Send + Sync>);

impl FactoryKey {
    /// Resolve a holder to its canonical key before any table access.
    fn of(holder: &dyn ResourceFactoryHolder) -> Self {
        Self(holder.underlying_factory())
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for FactoryKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for FactoryKey {}

impl Hash for FactoryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

/// Table of resources bound to one XA transaction.
#[derive(Default)]
pub struct ResourceBindings {
    bound: HashMap<FactoryKey, BoundResource>,
}

impl ResourceBindings {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a resource under the holder's factory identity, replacing any
    /// previous binding for the same factory.
    pub fn bind(&mut self, holder: &dyn ResourceFactoryHolder, resource: BoundResource) {
        self.bound.insert(FactoryKey::of(holder), resource);
    }

    /// Whether a resource is bound for the holder's factory.
    pub fn has(&self, holder: &dyn ResourceFactoryHolder) -> bool {
        self.bound.contains_key(&FactoryKey::of(holder))
    }

    /// The resource bound for the holder's factory, if any.
    pub fn get(&self, holder: &dyn ResourceFactoryHolder) -> Option<BoundResource> {
        self.bound.get(&FactoryKey::of(holder)).cloned()
    }

    /// Number of distinct factories with a binding.
    pub fn len(&self) -> usize {
        self.bound.len()
    }

    /// Whether the table holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}
