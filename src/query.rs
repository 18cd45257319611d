// src/query.rs
// `query()`'s contract: full scan of `live`, filtered by an opaque
// matcher and ordered by an opaque comparator supplied by the caller
// (the query planner and sort comparator are external collaborators).
// This module only owns the scan/sort/skip/limit shape.

use std::cmp::Ordering;

use serde_json::Value;

/// A query already "prepared" by an external planner: a predicate and a
/// total order over matching documents, plus pagination.
pub struct PreparedQuery {
    matcher: Box<dyn Fn(&Value) -> bool + Send + Sync>,
    comparator: Box<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl PreparedQuery {
    pub fn new(
        matcher: impl Fn(&Value) -> bool + Send + Sync + 'static,
        comparator: impl Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        PreparedQuery {
            matcher: Box::new(matcher),
            comparator: Box::new(comparator),
            skip: 0,
            limit: None,
        }
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        (self.matcher)(doc)
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        (self.comparator)(a, b)
    }
}

/// Run a prepared query against an already-scanned set of documents:
/// filter, sort, then apply `skip`/`limit`. This is deliberately
/// unindexed - correctness, not performance, is the contract.
pub fn execute(query: &PreparedQuery, documents: Vec<Value>) -> Vec<Value> {
    let mut matched: Vec<Value> = documents.into_iter().filter(|d| query.matches(d)).collect();
    matched.sort_by(|a, b| query.compare(a, b));

    let start = query.skip.min(matched.len());
    let end = match query.limit {
        Some(limit) => (start + limit).min(matched.len()),
        None => matched.len(),
    };
    matched[start..end].to_vec()
}
