//! Module Graph Port
//!
//! The cache never walks the dev server's module graph itself. When it
//! wants a stale entry gone it asks the graph to drop the resolved id and
//! trusts the answer: a refused drop means the module is still in active
//! use and the backing resource set must survive.

/// Port implemented by the live module-graph collaborator.
pub trait ModuleGraph: Send + Sync {
    /// Attempt to drop `id` from the live graph. Returns `false` when the
    /// module is still in active use and cannot be dropped.
    fn invalidate_module(&self, id: &str) -> bool;
}

/// Graph that confirms every drop. Used before a dev server attaches and
/// in tests that do not exercise partial invalidation.
#[derive(Debug, Default)]
pub struct NoopModuleGraph;

impl ModuleGraph for NoopModuleGraph {
    fn invalidate_module(&self, _id: &str) -> bool {
        true
    }
}
