use crate::context::ContextId;

use super::OwnerRef;

/// Outcome of an ownership lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Owned(ContextId),
    /// No context owns the target right now (unloaded area, untracked
    /// entity). Retryable, never an error.
    Unloaded,
}

/// Answers "which context owns this right now".
///
/// Backends call it when a task becomes eligible to run, not when it is
/// submitted, because ownership moves between the two.
pub trait RegionResolver: Send + Sync {
    fn resolve(&self, owner: &OwnerRef) -> Resolution;
}

/// Resolver for the non-partitioned runtime: everything belongs to one
/// context.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub ContextId);

impl RegionResolver for FixedResolver {
    fn resolve(&self, _owner: &OwnerRef) -> Resolution {
        Resolution::Owned(self.0)
    }
}
