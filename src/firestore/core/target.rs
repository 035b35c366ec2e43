use crate::firestore::core::bound::Bound;
use crate::firestore::core::filter::Filter;
use crate::firestore::core::query::OrderBy;
use crate::firestore::model::ResourcePath;

pub type TargetId = i32;

/// The backend-facing form of a query. Unlike a query, the order-by is
/// already normalized and a limit always applies to the first results.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_target(&self) -> bool {
        self.path.is_document_path() && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(&self.filters.iter().map(Filter::canonical_id).collect::<Vec<_>>().join(","));
        id.push_str("|ob:");
        id.push_str(&self.order_by.iter().map(OrderBy::canonical_id).collect::<Vec<_>>().join(","));
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.inclusive { "b:" } else { "a:" });
            id.push_str(&start.canonical_position());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.inclusive { "a:" } else { "b:" });
            id.push_str(&end.canonical_position());
        }
        id
    }
}

/// Hands out target ids from disjoint sequences: even ids for targets
/// allocated by the local store, odd ids for limbo resolution targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    /// Continues a target cache sequence after `highest` (which must be
    /// even).
    pub fn after(highest: TargetId) -> Self {
        Self { last_id: highest }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
