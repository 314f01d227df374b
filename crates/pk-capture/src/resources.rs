//! Resource references and their outcomes for one frame.

use pk_core::ResourceCategory;
use pk_core::SequenceIndex;
use pk_dom::NodeId;
use pk_net::FetchOutcome;
use pk_net::ReferrerPolicy;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Hands out sequence indices for one save operation; shared by every
/// frame of that operation.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> SequenceIndex {
        SequenceIndex(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Where a reference was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceOrigin {
    Element { node: NodeId, attribute: &'static str },
    /// Computed style of an element.
    RenderedStyle { node: NodeId },
    Stylesheet { sheet_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceReference {
    pub index: SequenceIndex,
    pub category: ResourceCategory,
    pub raw_url: String,
    pub resolved_url: String,
    pub referrer: String,
    pub referrer_policy: ReferrerPolicy,
    pub origin: ReferenceOrigin,
}

/// Discovered references of one frame, deduplicated by resolved URL, and
/// the outcomes buffered by sequence index.
#[derive(Debug, Default)]
pub struct ResourceTable {
    references: Vec<ResourceReference>,
    by_url: HashMap<String, SequenceIndex>,
    outcomes: HashMap<SequenceIndex, FetchOutcome>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reference unless its URL is already known. Returns the
    /// index of the reference that owns the URL.
    pub fn register(
        &mut self,
        allocator: &SequenceAllocator,
        reference: impl FnOnce(SequenceIndex) -> ResourceReference,
        resolved_url: &str,
    ) -> SequenceIndex {
        if let Some(index) = self.by_url.get(resolved_url) {
            return *index;
        }
        let index = allocator.allocate();
        let reference = reference(index);
        self.by_url.insert(resolved_url.to_owned(), index);
        self.references.push(reference);
        index
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn references(&self) -> &[ResourceReference] {
        &self.references
    }

    /// References without an outcome, in discovery order.
    pub fn pending(&self) -> Vec<ResourceReference> {
        self.references
            .iter()
            .filter(|reference| !self.outcomes.contains_key(&reference.index))
            .cloned()
            .collect()
    }

    pub fn resolve(&mut self, index: SequenceIndex, outcome: FetchOutcome) {
        self.outcomes.insert(index, outcome);
    }

    pub fn outcome(&self, index: SequenceIndex) -> Option<&FetchOutcome> {
        self.outcomes.get(&index)
    }

    pub fn index_of(&self, resolved_url: &str) -> Option<SequenceIndex> {
        self.by_url.get(resolved_url).copied()
    }

    pub fn outcome_for_url(&self, resolved_url: &str) -> Option<&FetchOutcome> {
        self.outcomes.get(self.by_url.get(resolved_url)?)
    }

    pub fn resolved_count(&self) -> usize {
        self.outcomes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ReferenceOrigin;
    use super::ResourceReference;
    use super::ResourceTable;
    use super::SequenceAllocator;
    use pk_core::ResourceCategory;
    use pk_core::SequenceIndex;
    use pk_net::FailureReason;
    use pk_net::FetchOutcome;
    use pk_net::ReferrerPolicy;

    fn reference(index: SequenceIndex, url: &str) -> ResourceReference {
        ResourceReference {
            index,
            category: ResourceCategory::Image,
            raw_url: url.to_owned(),
            resolved_url: url.to_owned(),
            referrer: "http://x/page.html".to_owned(),
            referrer_policy: ReferrerPolicy::default(),
            origin: ReferenceOrigin::Element {
                node: 1,
                attribute: "src",
            },
        }
    }

    #[test]
    fn same_url_is_one_reference() {
        let allocator = SequenceAllocator::new();
        let mut table = ResourceTable::new();
        let first = table.register(&allocator, |index| reference(index, "http://x/a.png"), "http://x/a.png");
        let again = table.register(&allocator, |index| reference(index, "http://x/a.png"), "http://x/a.png");
        let other = table.register(&allocator, |index| reference(index, "http://x/b.png"), "http://x/b.png");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(table.len(), 2);
        assert_eq!(allocator.allocated(), 2);
    }

    #[test]
    fn pending_shrinks_as_outcomes_arrive() {
        let allocator = SequenceAllocator::new();
        let mut table = ResourceTable::new();
        let a = table.register(&allocator, |index| reference(index, "http://x/a.png"), "http://x/a.png");
        table.register(&allocator, |index| reference(index, "http://x/b.png"), "http://x/b.png");
        assert_eq!(table.pending().len(), 2);

        table.resolve(a, FetchOutcome::Failed(FailureReason::Load(404)));
        assert_eq!(table.pending().len(), 1);
        assert_eq!(table.resolved_count(), 1);
        assert_eq!(
            table.outcome_for_url("http://x/a.png").and_then(FetchOutcome::failure),
            Some(FailureReason::Load(404))
        );
    }
}
