//! Index-coverage decision: which field a query would need an index on, and
//! whether the target collection has one whose leading key matches.

use crate::catalog::Catalog;
use bson::{Bson, Document};

fn strip_dollar(name: &str) -> &str {
    name.strip_prefix('$').unwrap_or(name)
}

fn strip_direction(name: &str) -> &str {
    name.strip_prefix('-').unwrap_or(name)
}

/// Wrapped form: the predicate travels under a leading `query` entry with
/// siblings such as `orderby`.
fn is_wrapped(query: &Document) -> bool {
    query.len() > 1
        && query
            .iter()
            .next()
            .is_some_and(|(name, _)| strip_dollar(name) == "query")
}

/// Top-level lookup tolerating a `$` prefix and case variance, which drivers
/// disagree on for meta-keys.
fn get_meta<'a>(doc: &'a Document, key: &str) -> Option<&'a Bson> {
    doc.iter()
        .find(|(name, _)| strip_dollar(name.as_str()).eq_ignore_ascii_case(key))
        .map(|(_, value)| value)
}

/// Select the field the query would need an index on.
///
/// Wrapped queries use the first entry of the inner predicate document. When
/// that yields nothing, an `orderby` sibling decides: a document contributes
/// its first key, a string its value minus any `-` direction prefix. The
/// final fallback is the outer document's first entry. `None` means the query
/// carries no predicate at all.
pub fn indexable_field(query: &Document) -> Option<String> {
    if is_wrapped(query) {
        let (_, first_value) = query.iter().next()?;
        let inner = match first_value {
            Bson::Document(inner) => inner,
            _ => query,
        };
        if let Some((name, _)) = inner.iter().next() {
            return Some(name.clone());
        }
    }

    match get_meta(query, "orderby") {
        Some(Bson::Document(order)) => {
            if let Some((name, _)) = order.iter().next() {
                return Some(name.clone());
            }
        }
        Some(Bson::String(field)) => return Some(strip_direction(field).to_string()),
        _ => {}
    }

    query.iter().next().map(|(name, _)| name.clone())
}

/// Decide whether `query` against `db.coll` is covered: true iff some index's
/// leading key, minus its direction prefix, equals the indexable field
/// case-insensitively.
///
/// Fails open: a catalog error logs a warning and accepts the query, so an
/// unavailable catalog never blocks traffic.
pub async fn query_is_covered(
    catalog: &dyn Catalog,
    db: &str,
    coll: &str,
    query: &Document,
) -> bool {
    if query.is_empty() {
        return true;
    }
    // Explain traffic is diagnostic; it must reach the server.
    if is_wrapped(query) && get_meta(query, "explain").is_some() {
        return true;
    }
    let Some(field) = indexable_field(query) else {
        return true;
    };

    match catalog.indexes(db, coll).await {
        Ok(indexes) => indexes.iter().any(|index| {
            index
                .key
                .first()
                .is_some_and(|leading| strip_direction(leading).eq_ignore_ascii_case(&field))
        }),
        Err(e) => {
            tracing::warn!(error = %e, db, coll, "catalog lookup failed; accepting query");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexSpec;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use bson::doc;

    struct StubCatalog {
        indexes: Vec<IndexSpec>,
        fail: bool,
    }

    impl StubCatalog {
        fn with_keys(keys: &[&[&str]]) -> Self {
            Self {
                indexes: keys
                    .iter()
                    .map(|key| IndexSpec {
                        key: key.iter().map(|f| f.to_string()).collect(),
                    })
                    .collect(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                indexes: Vec::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Catalog for StubCatalog {
        async fn indexes(&self, _db: &str, _coll: &str) -> Result<Vec<IndexSpec>> {
            if self.fail {
                return Err(Error::CatalogUnavailable("stub outage".into()));
            }
            Ok(self.indexes.clone())
        }
    }

    #[test]
    fn plain_query_uses_first_entry() {
        let query = doc! { "name": "alice", "age": 30 };
        assert_eq!(indexable_field(&query).as_deref(), Some("name"));
    }

    #[test]
    fn wrapped_query_uses_inner_first_entry() {
        let query = doc! {
            "query": { "status": "active", "kind": "a" },
            "orderby": { "created_at": -1 },
        };
        assert_eq!(indexable_field(&query).as_deref(), Some("status"));
    }

    #[test]
    fn dollar_prefixed_wrapper_is_unwrapped() {
        let query = doc! { "$query": { "status": "active" }, "$orderby": { "x": 1 } };
        assert_eq!(indexable_field(&query).as_deref(), Some("status"));
    }

    #[test]
    fn empty_inner_query_falls_back_to_orderby_document() {
        let query = doc! { "query": {}, "orderby": { "created_at": -1 } };
        assert_eq!(indexable_field(&query).as_deref(), Some("created_at"));
    }

    #[test]
    fn empty_inner_query_falls_back_to_orderby_string() {
        let query = doc! { "query": {}, "orderby": "-created_at" };
        assert_eq!(indexable_field(&query).as_deref(), Some("created_at"));
    }

    #[test]
    fn orderby_match_is_case_insensitive() {
        let query = doc! { "query": {}, "OrderBy": "age" };
        assert_eq!(indexable_field(&query).as_deref(), Some("age"));
    }

    #[test]
    fn lone_query_entry_is_not_unwrapped() {
        // Only one entry, so the wrapped form does not apply
        let query = doc! { "query": "verbatim" };
        assert_eq!(indexable_field(&query).as_deref(), Some("query"));
    }

    #[test]
    fn empty_document_has_no_indexable_field() {
        assert_eq!(indexable_field(&doc! {}), None);
    }

    #[tokio::test]
    async fn leading_key_match_accepts() {
        let catalog = StubCatalog::with_keys(&[&["_id"], &["status", "created_at"]]);
        let query = doc! { "status": "active" };
        assert!(query_is_covered(&catalog, "app", "events", &query).await);
    }

    #[tokio::test]
    async fn non_leading_key_does_not_count() {
        let catalog = StubCatalog::with_keys(&[&["status", "created_at"]]);
        let query = doc! { "created_at": { "$gt": 0 } };
        assert!(!query_is_covered(&catalog, "app", "events", &query).await);
    }

    #[tokio::test]
    async fn direction_prefix_is_stripped_before_match() {
        let catalog = StubCatalog::with_keys(&[&["-created_at"]]);
        let query = doc! { "query": {}, "orderby": "-created_at" };
        assert!(query_is_covered(&catalog, "app", "events", &query).await);
    }

    #[tokio::test]
    async fn leading_key_match_is_case_insensitive() {
        let catalog = StubCatalog::with_keys(&[&["Name"]]);
        let query = doc! { "name": "alice" };
        assert!(query_is_covered(&catalog, "app", "users", &query).await);
    }

    #[tokio::test]
    async fn unindexed_field_is_rejected() {
        let catalog = StubCatalog::with_keys(&[&["_id"]]);
        let query = doc! { "name": "alice" };
        assert!(!query_is_covered(&catalog, "app", "users", &query).await);
    }

    #[tokio::test]
    async fn empty_query_is_accepted_without_lookup() {
        let catalog = StubCatalog::failing();
        assert!(query_is_covered(&catalog, "app", "users", &doc! {}).await);
    }

    #[tokio::test]
    async fn explain_is_accepted() {
        let catalog = StubCatalog::with_keys(&[&["_id"]]);
        let query = doc! { "query": { "name": "alice" }, "$explain": true };
        assert!(query_is_covered(&catalog, "app", "users", &query).await);
    }

    #[tokio::test]
    async fn catalog_outage_fails_open() {
        let catalog = StubCatalog::failing();
        let query = doc! { "name": "alice" };
        assert!(query_is_covered(&catalog, "app", "users", &query).await);
    }
}
