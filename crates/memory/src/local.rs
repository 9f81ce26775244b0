//! In-process implementation of the store contract.
//!
//! Used when Neo4j is disabled and throughout the test suites. Scoring is
//! token overlap + entity match + recency; good enough to make recall
//! behave end-to-end without a database.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use parking_lot::RwLock;

use ag_domain::error::Result;

use crate::store::{
    require_user_id, DecayOutcome, Fact, GraphEdge, GraphMemoryStore, GraphNode, GraphView,
    MaintenanceParams, MemoryLayer, RecallLayer, SearchQuery, Snippet,
};

/// Importance below this is forgotten outright by `decay`.
const FORGET_THRESHOLD: f32 = 0.05;
/// Daily multiplicative decay for hot facts (warm/cold decay slower).
const HOT_DECAY: f32 = 0.9;
const WARM_DECAY: f32 = 0.97;
/// Hot facts sharing an entity needed to form a warm concept.
const CLUSTER_MIN: usize = 3;
/// Warm concepts needed before they fold into a cold summary.
const SUMMARY_MIN: usize = 3;

#[derive(Default)]
pub struct LocalStore {
    facts: RwLock<HashMap<String, Vec<Fact>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic helper: number of facts stored for a user.
    pub fn fact_count(&self, user_id: &str) -> usize {
        self.facts.read().get(user_id).map_or(0, Vec::len)
    }
}

#[async_trait::async_trait]
impl GraphMemoryStore for LocalStore {
    async fn upsert_fact(&self, user_id: &str, fact: Fact) -> Result<bool> {
        require_user_id(user_id)?;
        let mut facts = self.facts.write();
        let bucket = facts.entry(user_id.to_string()).or_default();
        if bucket.iter().any(|f| f.content_hash == fact.content_hash) {
            return Ok(false);
        }
        bucket.push(fact);
        Ok(true)
    }

    async fn search(&self, user_id: &str, query: &SearchQuery) -> Result<Vec<Snippet>> {
        require_user_id(user_id)?;
        let facts = self.facts.read();
        let Some(bucket) = facts.get(user_id) else {
            return Ok(Vec::new());
        };

        let query_tokens = tokenize(&query.text);
        let recent_cutoff = Utc::now() - Duration::days(query.recent_days);

        let visible = |f: &&Fact| {
            query
                .exclude_session
                .as_deref()
                .map(|sid| f.session_id != sid)
                .unwrap_or(true)
        };

        let mut snippets: Vec<Snippet> = Vec::new();

        // Cold and warm layers come first, regardless of the query: they
        // are pre-digested context.
        let mut push_layer = |layer: MemoryLayer, recall: RecallLayer, out: &mut Vec<Snippet>| {
            let mut hits: Vec<&Fact> = bucket
                .iter()
                .filter(|f| f.layer == layer)
                .filter(|f| visible(f))
                .collect();
            hits.sort_by(|a, b| {
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.created_at.cmp(&a.created_at))
            });
            for fact in hits.into_iter().take(query.per_layer) {
                out.push(snippet(fact, recall, None));
            }
        };
        push_layer(MemoryLayer::Cold, RecallLayer::Summary, &mut snippets);
        push_layer(MemoryLayer::Warm, RecallLayer::Concept, &mut snippets);

        // Direct hits: entity intersection or token overlap with the query.
        let mut direct: Vec<(&Fact, usize)> = bucket
            .iter()
            .filter(|f| f.layer == MemoryLayer::Hot)
            .filter(|f| visible(f))
            .filter_map(|f| {
                let entity_hits = f
                    .entities
                    .iter()
                    .filter(|e| {
                        query
                            .entities
                            .iter()
                            .any(|q| q.eq_ignore_ascii_case(e))
                    })
                    .count();
                let token_hits = tokenize(&f.content)
                    .iter()
                    .filter(|t| query_tokens.contains(*t))
                    .count();
                let score = entity_hits * 3 + token_hits;
                (score > 0).then_some((f, score))
            })
            .collect();
        direct.sort_by(|a, b| b.1.cmp(&a.1));
        let direct_entities: Vec<String> = direct
            .iter()
            .flat_map(|(f, _)| f.entities.iter().cloned())
            .collect();
        for &(fact, _) in direct.iter().take(query.per_layer) {
            snippets.push(snippet(fact, RecallLayer::Direct, None));
        }

        // Related: hot facts sharing an entity with a direct hit, not
        // already included.
        let included: Vec<&str> = snippets.iter().map(|s| s.content.as_str()).collect();
        let related: Vec<(&Fact, String)> = bucket
            .iter()
            .filter(|f| f.layer == MemoryLayer::Hot)
            .filter(|f| visible(f))
            .filter(|f| !included.contains(&f.content.as_str()))
            .filter_map(|f| {
                f.entities
                    .iter()
                    .find(|e| direct_entities.contains(e))
                    .map(|via| (f, via.clone()))
            })
            .collect();
        for (fact, via) in related.into_iter().take(query.per_layer) {
            snippets.push(snippet(fact, RecallLayer::Related, Some(via)));
        }

        // Recent: newest hot facts in the window, again skipping repeats.
        let included: Vec<&str> = snippets.iter().map(|s| s.content.as_str()).collect();
        let mut recent: Vec<&Fact> = bucket
            .iter()
            .filter(|f| f.layer == MemoryLayer::Hot)
            .filter(|f| visible(f))
            .filter(|f| f.created_at >= recent_cutoff)
            .filter(|f| !included.contains(&f.content.as_str()))
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for fact in recent.into_iter().take(query.per_layer) {
            snippets.push(snippet(fact, RecallLayer::Recent, None));
        }

        Ok(snippets)
    }

    async fn cluster(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_id(user_id)?;
        let mut facts = self.facts.write();
        let Some(bucket) = facts.get_mut(user_id) else {
            return Ok(0);
        };

        // Group unclustered hot facts by entity.
        let mut by_entity: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, fact) in bucket.iter().enumerate().take(params.max_items) {
            if fact.layer != MemoryLayer::Hot || fact.clustered {
                continue;
            }
            for entity in &fact.entities {
                by_entity.entry(entity.clone()).or_default().push(idx);
            }
        }

        let mut formed = 0usize;
        let mut concepts: Vec<Fact> = Vec::new();
        for (entity, indices) in by_entity {
            if indices.len() < CLUSTER_MIN {
                continue;
            }
            let members: Vec<String> = indices
                .iter()
                .map(|&i| bucket[i].content.clone())
                .collect();
            let importance = indices
                .iter()
                .map(|&i| bucket[i].importance)
                .fold(0.0f32, f32::max);
            let session_id = bucket[indices[0]].session_id.clone();

            let mut concept = Fact::new(
                user_id,
                &session_id,
                &format!("About {entity}: {}", members.join(" / ")),
                vec![entity],
                (importance + 0.1).min(1.0),
            );
            concept.layer = MemoryLayer::Warm;
            concepts.push(concept);

            for &i in &indices {
                bucket[i].clustered = true;
            }
            formed += 1;
        }
        bucket.extend(concepts);
        Ok(formed)
    }

    async fn summarize(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_id(user_id)?;
        let mut facts = self.facts.write();
        let Some(bucket) = facts.get_mut(user_id) else {
            return Ok(0);
        };

        let warm_unclustered: Vec<usize> = bucket
            .iter()
            .enumerate()
            .filter(|(_, f)| f.layer == MemoryLayer::Warm && !f.clustered)
            .map(|(i, _)| i)
            .take(params.max_items)
            .collect();
        if warm_unclustered.len() < SUMMARY_MIN {
            return Ok(0);
        }

        let members: Vec<String> = warm_unclustered
            .iter()
            .map(|&i| bucket[i].content.clone())
            .collect();
        let session_id = bucket[warm_unclustered[0]].session_id.clone();
        let mut summary = Fact::new(
            user_id,
            &session_id,
            &format!("Summary: {}", members.join(" | ")),
            Vec::new(),
            0.9,
        );
        summary.layer = MemoryLayer::Cold;
        for &i in &warm_unclustered {
            bucket[i].clustered = true;
        }
        bucket.push(summary);
        Ok(1)
    }

    async fn decay(&self, user_id: &str, params: &MaintenanceParams) -> Result<DecayOutcome> {
        require_user_id(user_id)?;
        let mut facts = self.facts.write();
        let Some(bucket) = facts.get_mut(user_id) else {
            return Ok(DecayOutcome::default());
        };

        let now = Utc::now();
        let mut outcome = DecayOutcome::default();

        for fact in bucket.iter_mut().take(params.max_items) {
            let due = fact
                .last_decay
                .map(|last| now - last >= Duration::days(1))
                .unwrap_or_else(|| now - fact.created_at >= Duration::days(1));
            if !due {
                continue;
            }
            let factor = match fact.layer {
                MemoryLayer::Hot => HOT_DECAY,
                MemoryLayer::Warm => WARM_DECAY,
                MemoryLayer::Cold => 1.0,
            };
            fact.importance *= factor;
            fact.last_decay = Some(now);
            outcome.decayed += 1;
        }

        let before = bucket.len();
        bucket.retain(|f| f.importance >= FORGET_THRESHOLD);
        outcome.removed = before - bucket.len();
        Ok(outcome)
    }

    async fn graph_view(&self, user_id: &str, session_id: &str) -> Result<GraphView> {
        require_user_id(user_id)?;
        let facts = self.facts.read();
        let Some(bucket) = facts.get(user_id) else {
            return Ok(GraphView::default());
        };

        let mut view = GraphView::default();
        let mut seen_entities: Vec<String> = Vec::new();

        for fact in bucket.iter().filter(|f| f.session_id == session_id) {
            view.nodes.push(GraphNode {
                id: fact.fact_id.clone(),
                node_type: "fact".into(),
                content: fact.content.clone(),
                layer: format!("{:?}", fact.layer).to_lowercase(),
                importance: fact.importance,
            });
            for entity in &fact.entities {
                let entity_id = format!("entity:{entity}");
                if !seen_entities.contains(entity) {
                    seen_entities.push(entity.clone());
                    view.nodes.push(GraphNode {
                        id: entity_id.clone(),
                        node_type: "entity".into(),
                        content: entity.clone(),
                        layer: "hot".into(),
                        importance: 0.5,
                    });
                }
                view.edges.push(GraphEdge {
                    source: fact.fact_id.clone(),
                    target: entity_id,
                    edge_type: "MENTIONS".into(),
                });
            }
        }
        Ok(view)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        require_user_id(user_id)?;
        self.facts.write().remove(user_id);
        Ok(())
    }

    async fn user_ids(&self) -> Result<Vec<String>> {
        Ok(self.facts.read().keys().cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn snippet(fact: &Fact, layer: RecallLayer, via: Option<String>) -> Snippet {
    Snippet {
        content: fact.content.clone(),
        layer,
        importance: fact.importance,
        created_at: fact.created_at,
        session_id: fact.session_id.clone(),
        via,
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str, entities: &[&str]) -> SearchQuery {
        SearchQuery {
            text: text.into(),
            entities: entities.iter().map(|s| s.to_string()).collect(),
            per_layer: 3,
            exclude_session: None,
            recent_days: 7,
        }
    }

    #[tokio::test]
    async fn upsert_dedups_on_content_hash() {
        let store = LocalStore::new();
        let fact = Fact::new("u1", "s1", "I am 26.", vec!["26".into()], 0.8);
        assert!(store.upsert_fact("u1", fact.clone()).await.unwrap());

        let again = Fact::new("u1", "s2", "i  am 26.", vec!["26".into()], 0.8);
        assert!(!store.upsert_fact("u1", again).await.unwrap());
        assert_eq!(store.fact_count("u1"), 1);
    }

    #[tokio::test]
    async fn search_is_user_scoped() {
        let store = LocalStore::new();
        store
            .upsert_fact(
                "u1",
                Fact::new("u1", "s1", "Wang Er is 26 years old.", vec!["Wang".into(), "26".into()], 0.9),
            )
            .await
            .unwrap();

        let hits = store.search("u2", &query("how old", &[])).await.unwrap();
        assert!(hits.is_empty());

        let hits = store.search("u1", &query("how old is Wang", &["Wang"])).await.unwrap();
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn search_without_user_fails_closed() {
        let store = LocalStore::new();
        assert!(store.search("", &query("x", &[])).await.is_err());
    }

    #[tokio::test]
    async fn current_session_is_excluded() {
        let store = LocalStore::new();
        store
            .upsert_fact("u1", Fact::new("u1", "sA", "fact from A", vec![], 0.5))
            .await
            .unwrap();

        let mut q = query("fact from", &[]);
        q.exclude_session = Some("sA".into());
        assert!(store.search("u1", &q).await.unwrap().is_empty());

        q.exclude_session = Some("sB".into());
        assert!(!store.search("u1", &q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cluster_forms_concepts_and_is_idempotent() {
        let store = LocalStore::new();
        for i in 0..3 {
            store
                .upsert_fact(
                    "u1",
                    Fact::new("u1", "s1", &format!("Rust note {i}"), vec!["Rust".into()], 0.5),
                )
                .await
                .unwrap();
        }

        let params = MaintenanceParams::default();
        assert_eq!(store.cluster("u1", &params).await.unwrap(), 1);
        // Second pass with no new writes: nothing left to cluster.
        assert_eq!(store.cluster("u1", &params).await.unwrap(), 0);

        let hits = store.search("u1", &query("", &[])).await.unwrap();
        assert!(hits.iter().any(|s| s.layer == RecallLayer::Concept));
    }

    #[tokio::test]
    async fn summarize_folds_warm_into_cold() {
        let store = LocalStore::new();
        let params = MaintenanceParams::default();
        for topic in ["Rust", "Tokio", "Axum"] {
            for i in 0..3 {
                store
                    .upsert_fact(
                        "u1",
                        Fact::new("u1", "s1", &format!("{topic} note {i}"), vec![topic.into()], 0.5),
                    )
                    .await
                    .unwrap();
            }
        }
        assert_eq!(store.cluster("u1", &params).await.unwrap(), 3);
        assert_eq!(store.summarize("u1", &params).await.unwrap(), 1);
        assert_eq!(store.summarize("u1", &params).await.unwrap(), 0);

        let hits = store.search("u1", &query("", &[])).await.unwrap();
        assert!(hits.iter().any(|s| s.layer == RecallLayer::Summary));
    }

    #[tokio::test]
    async fn decay_is_daily_idempotent() {
        let store = LocalStore::new();
        let mut fact = Fact::new("u1", "s1", "old fact", vec![], 0.5);
        fact.created_at = Utc::now() - Duration::days(3);
        store.upsert_fact("u1", fact).await.unwrap();

        let params = MaintenanceParams::default();
        let first = store.decay("u1", &params).await.unwrap();
        assert_eq!(first.decayed, 1);

        // Same day: no further decay.
        let second = store.decay("u1", &params).await.unwrap();
        assert_eq!(second.decayed, 0);
    }

    #[tokio::test]
    async fn forgotten_facts_are_removed() {
        let store = LocalStore::new();
        let mut fact = Fact::new("u1", "s1", "fading", vec![], 0.04);
        fact.created_at = Utc::now() - Duration::days(2);
        store.upsert_fact("u1", fact).await.unwrap();

        let outcome = store.decay("u1", &MaintenanceParams::default()).await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(store.fact_count("u1"), 0);
    }

    #[tokio::test]
    async fn graph_view_is_session_scoped() {
        let store = LocalStore::new();
        store
            .upsert_fact("u1", Fact::new("u1", "sA", "likes Rust", vec!["Rust".into()], 0.5))
            .await
            .unwrap();
        store
            .upsert_fact("u1", Fact::new("u1", "sB", "likes Go", vec!["Go".into()], 0.5))
            .await
            .unwrap();

        let view = store.graph_view("u1", "sA").await.unwrap();
        assert_eq!(view.nodes.iter().filter(|n| n.node_type == "fact").count(), 1);
        assert!(view.nodes.iter().any(|n| n.content == "likes Rust"));
        assert!(!view.nodes.iter().any(|n| n.content == "likes Go"));
    }
}
