//! Link target resolution.

use crate::Result;
use crate::models::Entity;
use crate::services::permalink::generate_permalink;
use crate::storage::GraphStore;
use std::sync::Arc;

/// Binds `[[link]]` targets to entities.
///
/// Lookup order, first hit wins:
/// 1. exact permalink
/// 2. permalink of the normalized target
/// 3. title, case-insensitive, most recently updated first
/// 4. file path, as written and with a `.md` extension
#[derive(Clone)]
pub struct LinkResolver {
    store: Arc<dyn GraphStore>,
}

impl LinkResolver {
    /// Creates a resolver over a store.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Resolves `target` within a project.
    pub fn resolve(&self, project_id: i64, target: &str) -> Result<Option<Entity>> {
        let target = target.trim();
        if target.is_empty() {
            return Ok(None);
        }

        if let Some(entity) = self.store.find_by_permalink(project_id, target)? {
            return Ok(Some(entity));
        }

        let normalized = generate_permalink(target);
        if !normalized.is_empty() && normalized != target {
            if let Some(entity) = self.store.find_by_permalink(project_id, &normalized)? {
                return Ok(Some(entity));
            }
        }

        if let Some(entity) = self.store.find_by_title(project_id, target)?.into_iter().next() {
            return Ok(Some(entity));
        }

        if let Some(entity) = self.store.find_by_file_path(project_id, target)? {
            return Ok(Some(entity));
        }
        self.store
            .find_by_file_path(project_id, &format!("{target}.md"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MARKDOWN_CONTENT_TYPE, NewEntity};
    use crate::storage::SqliteGraphStore;
    use std::collections::BTreeMap;

    fn setup() -> (LinkResolver, Arc<SqliteGraphStore>, i64) {
        let store = Arc::new(SqliteGraphStore::in_memory().unwrap());
        let pid = store.ensure_project("test", "/tmp").unwrap().id;
        let entity = NewEntity {
            title: "Search Design".to_string(),
            entity_type: "note".to_string(),
            content_type: MARKDOWN_CONTENT_TYPE.to_string(),
            permalink: Some("specs/search-design".to_string()),
            file_path: "specs/Search Design.md".to_string(),
            checksum: None,
            metadata: BTreeMap::new(),
        };
        store.upsert_entity(pid, &entity, &[], &[]).unwrap();
        (LinkResolver::new(store.clone()), store, pid)
    }

    #[test]
    fn test_resolves_by_permalink_title_and_path() {
        let (resolver, _store, pid) = setup();
        for target in [
            "specs/search-design",
            "specs/Search Design",
            "search design",
            "specs/Search Design.md",
        ] {
            let found = resolver.resolve(pid, target).unwrap();
            assert_eq!(
                found.map(|e| e.title).as_deref(),
                Some("Search Design"),
                "target {target}"
            );
        }
    }

    #[test]
    fn test_unknown_target() {
        let (resolver, _store, pid) = setup();
        assert!(resolver.resolve(pid, "nothing here").unwrap().is_none());
        assert!(resolver.resolve(pid, "   ").unwrap().is_none());
    }
}
