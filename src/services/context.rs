//! Graph context building.
//!
//! Resolves a seed to a page of primary items and walks relation edges
//! breadth-first from each primary entity, in both directions, up to the
//! requested depth.
//!
//! # Timeframes
//!
//! With `since` set, seeds, observations, edges and reached entities must
//! all be touched at or after the cutoff. An edge outside the timeframe is
//! never followed, even if the entity behind it is recent.

use crate::models::{
    ContextItem, ContextMetadata, ContextRequest, ContextResult, ContextSeed, Entity, EntityId,
    EntitySummary, GraphContext, ObservationSummary, RelatedItem, Relation, RelationSummary,
};
use crate::services::link_resolver::LinkResolver;
use crate::storage::GraphStore;
use crate::{Result, now_millis};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Default window of the `recent` seed when no `since` is given.
pub const DEFAULT_RECENT_WINDOW_DAYS: i64 = 7;

/// Answers "what is connected to X" queries.
#[derive(Clone)]
pub struct ContextService {
    store: Arc<dyn GraphStore>,
    resolver: LinkResolver,
    recent_window: Duration,
}

impl ContextService {
    /// Creates a context service.
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        let resolver = LinkResolver::new(Arc::clone(&store));
        Self {
            store,
            resolver,
            recent_window: Duration::days(DEFAULT_RECENT_WINDOW_DAYS),
        }
    }

    /// Sets the window used by the `recent` seed without `since`.
    #[must_use]
    pub const fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = window;
        self
    }

    /// Builds the context for a request within a project.
    #[instrument(skip(self, request), fields(operation = "build_context", seed = %request.seed, depth = request.depth))]
    pub fn build_context(&self, project_id: i64, request: &ContextRequest) -> Result<GraphContext> {
        let start = Instant::now();
        let since = request.since;

        let mut primaries = self.seed_items(project_id, request)?;
        primaries.sort_by(|a, b| {
            b.timestamp()
                .cmp(&a.timestamp())
                .then_with(|| a.permalink().cmp(b.permalink()))
        });

        let page = request.page.max(1);
        let page_size = request.page_size.max(1);
        let total_seeds = primaries.len();
        let offset = (page - 1).saturating_mul(page_size);
        let has_more = total_seeds > offset.saturating_add(page_size);

        let mut keys = KeyCache::default();
        let mut results = Vec::new();
        for primary in primaries.into_iter().skip(offset).take(page_size) {
            let result = match primary.entity_id() {
                Some(id) => self.expand(id, primary, request, &mut keys)?,
                None => ContextResult {
                    primary,
                    observations: Vec::new(),
                    related: Vec::new(),
                },
            };
            results.push(result);
        }

        metrics::histogram!("notegraph_context_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        Ok(GraphContext {
            results,
            metadata: ContextMetadata {
                seed: request.seed.to_string(),
                depth: request.depth,
                since,
                page,
                page_size,
                total_seeds,
                has_more,
                generated_at: now_millis(),
            },
        })
    }

    fn seed_items(&self, project_id: i64, request: &ContextRequest) -> Result<Vec<ContextItem>> {
        let in_window = |ts: DateTime<Utc>| request.since.is_none_or(|since| ts >= since);
        let entities: Vec<Entity> = match &request.seed {
            ContextSeed::Permalink(permalink) => {
                let found = match self.store.find_by_permalink(project_id, permalink)? {
                    Some(entity) => Some(entity),
                    None => self.resolver.resolve(project_id, permalink)?,
                };
                found.into_iter().collect()
            },
            ContextSeed::Pattern(pattern) => self.store.find_by_pattern(project_id, pattern)?,
            ContextSeed::Recent => return self.recent_items(project_id, request.since),
        };
        Ok(entities
            .iter()
            .filter(|e| in_window(e.updated_at))
            .map(|e| ContextItem::Entity(EntitySummary::from(e)))
            .collect())
    }

    /// Everything touched since the cutoff: entities, relations, observations.
    fn recent_items(&self, project_id: i64, since: Option<DateTime<Utc>>) -> Result<Vec<ContextItem>> {
        let since = since.unwrap_or_else(|| now_millis() - self.recent_window);
        let entities = self.store.recent_entities(project_id, since)?;
        let relations = self.store.recent_relations(project_id, since)?;
        let observations = self.store.recent_observations(project_id, since)?;

        let mut keys = KeyCache::default();
        keys.insert_all(&entities);
        let mut wanted: Vec<EntityId> = relations
            .iter()
            .flat_map(|r| std::iter::once(r.from_id).chain(r.to_id))
            .chain(observations.iter().map(|o| o.entity_id))
            .collect();
        wanted.sort_unstable();
        wanted.dedup();
        keys.load(&*self.store, &wanted)?;

        let mut items: Vec<ContextItem> = entities
            .iter()
            .map(|e| ContextItem::Entity(EntitySummary::from(e)))
            .collect();
        items.extend(
            relations
                .iter()
                .map(|r| ContextItem::Relation(keys.relation_summary(r))),
        );
        items.extend(observations.iter().map(|o| {
            ContextItem::Observation(ObservationSummary::new(o, keys.key(o.entity_id)))
        }));
        Ok(items)
    }

    /// Walks outward from one primary entity.
    fn expand(
        &self,
        seed: EntityId,
        primary: ContextItem,
        request: &ContextRequest,
        keys: &mut KeyCache,
    ) -> Result<ContextResult> {
        let since = request.since;
        let in_window = |ts: DateTime<Utc>| since.is_none_or(|since| ts >= since);

        let observations = self
            .store
            .observations_for(&[seed])?
            .into_iter()
            .filter(|o| in_window(o.created_at));
        let seed_key = primary.permalink().to_string();
        let observations: Vec<ObservationSummary> = observations
            .map(|o| ObservationSummary::new(&o, &seed_key))
            .collect();

        let mut visited: HashSet<EntityId> = HashSet::from([seed]);
        let mut seen_relations: HashSet<i64> = HashSet::new();
        let mut frontier: BTreeSet<EntityId> = BTreeSet::from([seed]);
        let mut related = Vec::new();

        for depth in 1..=request.depth {
            if frontier.is_empty() {
                break;
            }
            let ids: Vec<EntityId> = frontier.iter().copied().collect();
            let edges: Vec<Relation> = self
                .store
                .relations_touching(&ids, since)?
                .into_iter()
                .filter(|r| seen_relations.insert(r.id))
                .collect();

            let mut candidates: Vec<EntityId> = Vec::new();
            for edge in &edges {
                let other = if frontier.contains(&edge.from_id) {
                    edge.to_id
                } else {
                    Some(edge.from_id)
                };
                if let Some(other) = other {
                    if !visited.contains(&other) {
                        candidates.push(other);
                    }
                }
            }
            candidates.sort_unstable();
            candidates.dedup();

            let reached = self.store.get_entities(&candidates)?;
            keys.insert_all(&reached);
            let endpoint_ids: Vec<EntityId> = edges
                .iter()
                .flat_map(|r| std::iter::once(r.from_id).chain(r.to_id))
                .collect();
            keys.load(&*self.store, &endpoint_ids)?;

            for edge in &edges {
                related.push(RelatedItem {
                    depth,
                    item: ContextItem::Relation(keys.relation_summary(edge)),
                });
            }

            let mut next = BTreeSet::new();
            for entity in reached.iter().filter(|e| in_window(e.updated_at)) {
                if visited.insert(entity.id) {
                    next.insert(entity.id);
                    related.push(RelatedItem {
                        depth,
                        item: ContextItem::Entity(EntitySummary::from(entity)),
                    });
                }
            }
            frontier = next;
        }

        related.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| Reverse(a.item.timestamp()).cmp(&Reverse(b.item.timestamp())))
                .then_with(|| a.item.permalink().cmp(b.item.permalink()))
        });
        related.truncate(request.max_related);

        Ok(ContextResult {
            primary,
            observations,
            related,
        })
    }
}

/// Permalinks (or file paths) of entities seen while building a context.
#[derive(Default)]
struct KeyCache {
    keys: HashMap<EntityId, String>,
}

impl KeyCache {
    fn insert_all(&mut self, entities: &[Entity]) {
        for entity in entities {
            self.keys
                .insert(entity.id, entity.link_key().to_string());
        }
    }

    fn load(&mut self, store: &dyn GraphStore, ids: &[EntityId]) -> Result<()> {
        let missing: Vec<EntityId> = ids
            .iter()
            .copied()
            .filter(|id| !self.keys.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            let entities = store.get_entities(&missing)?;
            self.insert_all(&entities);
        }
        Ok(())
    }

    fn key(&self, id: EntityId) -> &str {
        self.keys.get(&id).map_or("", String::as_str)
    }

    fn relation_summary(&self, relation: &Relation) -> RelationSummary {
        let to_key = relation
            .to_id
            .map_or(relation.to_name.as_str(), |id| self.key(id));
        RelationSummary::new(relation, self.key(relation.from_id), to_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        MARKDOWN_CONTENT_TYPE, NewEntity, NewRelation, ObservationSpec, RelationSpec,
    };
    use crate::storage::SqliteGraphStore;
    use std::collections::BTreeMap;

    struct Graph {
        service: ContextService,
        store: Arc<SqliteGraphStore>,
        pid: i64,
    }

    impl Graph {
        fn new() -> Self {
            let store = Arc::new(SqliteGraphStore::in_memory().unwrap());
            let pid = store.ensure_project("test", "/tmp").unwrap().id;
            Self {
                service: ContextService::new(store.clone()),
                store,
                pid,
            }
        }

        /// Upserts `name` with resolved edges to `links`.
        fn node(&self, name: &str, links: &[&str]) -> EntityId {
            let relations: Vec<NewRelation> = links
                .iter()
                .map(|target| {
                    let mut rel = NewRelation::unresolved(&RelationSpec::new("relates_to", *target));
                    rel.to_id = self
                        .store
                        .find_by_permalink(self.pid, target)
                        .unwrap()
                        .map(|e| e.id);
                    rel
                })
                .collect();
            let entity = NewEntity {
                title: name.to_string(),
                entity_type: "note".to_string(),
                content_type: MARKDOWN_CONTENT_TYPE.to_string(),
                permalink: Some(name.to_string()),
                file_path: format!("{name}.md"),
                checksum: None,
                metadata: BTreeMap::new(),
            };
            self.store
                .upsert_entity(
                    self.pid,
                    &entity,
                    &[ObservationSpec::new("fact", format!("about {name}"))],
                    &relations,
                )
                .unwrap()
                .entity
                .id
        }

        fn context(&self, request: &ContextRequest) -> GraphContext {
            self.service.build_context(self.pid, request).unwrap()
        }
    }

    fn related_entities(result: &ContextResult) -> Vec<(usize, String)> {
        result
            .related
            .iter()
            .filter_map(|r| match &r.item {
                ContextItem::Entity(e) => Some((r.depth, e.permalink.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_depth_bounds_traversal() {
        let graph = Graph::new();
        graph.node("c", &[]);
        graph.node("b", &["c"]);
        graph.node("a", &["b"]);

        let seed = ContextSeed::parse("a");
        let one = graph.context(&ContextRequest::new(seed.clone()).with_depth(1));
        assert_eq!(related_entities(&one.results[0]), vec![(1, "b".to_string())]);
        assert_eq!(one.results[0].observations.len(), 1);

        let two = graph.context(&ContextRequest::new(seed.clone()).with_depth(2));
        assert_eq!(
            related_entities(&two.results[0]),
            vec![(1, "b".to_string()), (2, "c".to_string())]
        );

        let zero = graph.context(&ContextRequest::new(seed).with_depth(0));
        assert!(zero.results[0].related.is_empty());
    }

    #[test]
    fn test_traverses_incoming_edges() {
        let graph = Graph::new();
        graph.node("target", &[]);
        graph.node("source", &["target"]);
        let ctx = graph.context(&ContextRequest::new(ContextSeed::parse("memory://target")));
        assert_eq!(
            related_entities(&ctx.results[0]),
            vec![(1, "source".to_string())]
        );
    }

    #[test]
    fn test_old_edge_to_recent_node_is_not_followed() {
        let graph = Graph::new();
        graph.node("b", &[]);
        graph.node("a", &["b"]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let cutoff = now_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Touch both entities without touching the edge.
        graph.node("b", &[]);
        let a = graph.store.find_by_permalink(graph.pid, "a").unwrap().unwrap();
        graph
            .store
            .move_entity(a.id, "a.md", "a", Some("a"))
            .unwrap();

        let ctx = graph.context(&ContextRequest::new(ContextSeed::parse("a")).with_since(cutoff));
        assert_eq!(ctx.results.len(), 1);
        assert!(ctx.results[0].related.is_empty());
    }

    #[test]
    fn test_pattern_seed_pages_and_caps() {
        let graph = Graph::new();
        for name in ["hub", "x1", "x2", "x3"] {
            graph.node(name, &[]);
        }
        graph.node("spoke", &["hub", "x1", "x2", "x3"]);

        let page = graph.context(&ContextRequest::new(ContextSeed::parse("x*")).with_page(1, 2));
        assert_eq!(page.metadata.total_seeds, 3);
        assert!(page.metadata.has_more);
        assert_eq!(page.results.len(), 2);

        let last = graph.context(&ContextRequest::new(ContextSeed::parse("x*")).with_page(2, 2));
        assert!(!last.metadata.has_more);
        assert_eq!(last.results.len(), 1);

        let capped = graph.context(
            &ContextRequest::new(ContextSeed::parse("spoke"))
                .with_max_related(3),
        );
        assert_eq!(capped.results[0].related.len(), 3);
    }

    #[test]
    fn test_recent_seed_includes_all_item_kinds() {
        let graph = Graph::new();
        graph.node("b", &[]);
        graph.node("a", &["b"]);
        let ctx = graph.context(&ContextRequest::new(ContextSeed::Recent).with_page(1, 50));
        let kinds: BTreeSet<&str> = ctx
            .results
            .iter()
            .map(|r| match r.primary {
                ContextItem::Entity(_) => "entity",
                ContextItem::Observation(_) => "observation",
                ContextItem::Relation(_) => "relation",
            })
            .collect();
        assert_eq!(kinds, BTreeSet::from(["entity", "observation", "relation"]));
        assert_eq!(ctx.metadata.seed, "memory://recent");
    }

    #[test]
    fn test_unknown_seed_is_empty() {
        let graph = Graph::new();
        let ctx = graph.context(&ContextRequest::new(ContextSeed::parse("nothing")));
        assert!(ctx.results.is_empty());
        assert_eq!(ctx.metadata.total_seeds, 0);
    }
}
