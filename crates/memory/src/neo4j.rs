//! Neo4j implementation of the store contract, over the HTTP transaction
//! API.
//!
//! Graph schema:
//!
//! ```text
//! (:Fact {id, content, hash, importance, layer, created_at, clustered,
//!         last_decay, session_id})-[:BELONGS_TO]->(:User {id})
//! (:Fact)-[:MENTIONS]->(:Entity {name, user_id})
//! ```
//!
//! Every statement is parameterized with `$user_id` — there is no query in
//! this module that can cross a tenant boundary. Transient failures (5xx,
//! timeouts) retry with exponential backoff; 4xx is permanent.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use ag_domain::config::Neo4jConfig;
use ag_domain::error::{Error, Result};

use crate::store::{
    require_user_id, DecayOutcome, Fact, GraphEdge, GraphMemoryStore, GraphNode, GraphView,
    MaintenanceParams, MemoryLayer, RecallLayer, SearchQuery, Snippet,
};

pub struct Neo4jStore {
    http: reqwest::Client,
    tx_url: String,
    username: String,
    password: String,
    max_retries: u32,
}

impl Neo4jStore {
    pub fn new(cfg: &Neo4jConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

        Ok(Self {
            http,
            tx_url: format!(
                "{}/db/{}/tx/commit",
                cfg.uri.trim_end_matches('/'),
                cfg.database
            ),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            max_retries: cfg.max_retries,
        })
    }

    /// Run one Cypher statement and return its rows (`row` format).
    async fn query(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>> {
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": parameters,
            }]
        });

        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let result = self
                .http
                .post(&self.tx_url)
                .basic_auth(&self.username, Some(&self.password))
                .json(&body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(Error::UpstreamUnavailable(format!("neo4j: {e}")));
                    continue;
                }
            };

            let status = resp.status();
            if status.is_server_error() {
                last_err = Some(Error::UpstreamUnavailable(format!(
                    "neo4j returned {status}"
                )));
                continue;
            }
            if !status.is_success() {
                return Err(Error::UpstreamUnavailable(format!(
                    "neo4j returned {status}"
                )));
            }

            let payload: Value = resp
                .json()
                .await
                .map_err(|e| Error::UpstreamUnavailable(format!("neo4j body: {e}")))?;

            if let Some(first_error) = payload
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errs| errs.first())
            {
                return Err(Error::UpstreamUnavailable(format!(
                    "neo4j error: {first_error}"
                )));
            }

            let rows = payload
                .get("results")
                .and_then(Value::as_array)
                .and_then(|r| r.first())
                .and_then(|r| r.get("data"))
                .and_then(Value::as_array)
                .map(|data| {
                    data.iter()
                        .filter_map(|d| d.get("row").and_then(Value::as_array).cloned())
                        .collect()
                })
                .unwrap_or_default();
            return Ok(rows);
        }

        Err(last_err.unwrap_or_else(|| Error::UpstreamUnavailable("neo4j unreachable".into())))
    }
}

fn layer_str(layer: MemoryLayer) -> &'static str {
    match layer {
        MemoryLayer::Hot => "hot",
        MemoryLayer::Warm => "warm",
        MemoryLayer::Cold => "cold",
    }
}

fn row_snippet(row: &[Value], layer: RecallLayer) -> Option<Snippet> {
    Some(Snippet {
        content: row.first()?.as_str()?.to_string(),
        layer,
        importance: row.get(1).and_then(Value::as_f64).unwrap_or(0.5) as f32,
        created_at: row
            .get(2)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(Utc::now),
        session_id: row
            .get(3)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        via: row.get(4).and_then(Value::as_str).map(str::to_string),
    })
}

#[async_trait::async_trait]
impl GraphMemoryStore for Neo4jStore {
    async fn upsert_fact(&self, user_id: &str, fact: Fact) -> Result<bool> {
        require_user_id(user_id)?;

        // Hash guard first: skip near-duplicates without writing.
        let existing = self
            .query(
                "MATCH (f:Fact {hash: $hash})-[:BELONGS_TO]->(:User {id: $user_id}) \
                 RETURN count(f)",
                json!({"hash": fact.content_hash, "user_id": user_id}),
            )
            .await?;
        if existing
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0)
            > 0
        {
            return Ok(false);
        }

        self.query(
            "MERGE (u:User {id: $user_id}) \
             CREATE (f:Fact {id: $id, content: $content, hash: $hash, \
                     importance: $importance, layer: $layer, \
                     created_at: $created_at, clustered: false, \
                     session_id: $session_id}) \
             CREATE (f)-[:BELONGS_TO]->(u) \
             WITH f \
             UNWIND $entities AS entity_name \
             MERGE (e:Entity {name: entity_name, user_id: $user_id}) \
             CREATE (f)-[:MENTIONS]->(e)",
            json!({
                "user_id": user_id,
                "id": fact.fact_id,
                "content": fact.content,
                "hash": fact.content_hash,
                "importance": fact.importance,
                "layer": layer_str(fact.layer),
                "created_at": fact.created_at.to_rfc3339(),
                "session_id": fact.session_id,
                "entities": fact.entities,
            }),
        )
        .await?;
        Ok(true)
    }

    async fn search(&self, user_id: &str, query: &SearchQuery) -> Result<Vec<Snippet>> {
        require_user_id(user_id)?;
        let exclude = query.exclude_session.clone().unwrap_or_default();
        let per_layer = query.per_layer as i64;
        let mut snippets = Vec::new();

        // Cold then warm layers: pre-digested context, no entity filter.
        for (layer, recall) in [
            ("cold", RecallLayer::Summary),
            ("warm", RecallLayer::Concept),
        ] {
            let rows = self
                .query(
                    "MATCH (f:Fact {layer: $layer})-[:BELONGS_TO]->(:User {id: $user_id}) \
                     WHERE f.session_id <> $exclude \
                     RETURN f.content, f.importance, f.created_at, f.session_id \
                     ORDER BY f.importance DESC, f.created_at DESC LIMIT $limit",
                    json!({
                        "layer": layer,
                        "user_id": user_id,
                        "exclude": exclude,
                        "limit": per_layer,
                    }),
                )
                .await?;
            snippets.extend(rows.iter().filter_map(|r| row_snippet(r, recall)));
        }

        // Direct entity hits.
        let rows = self
            .query(
                "UNWIND $entities AS wanted \
                 MATCH (e:Entity {user_id: $user_id}) \
                 WHERE toLower(e.name) = toLower(wanted) \
                 MATCH (f:Fact {layer: 'hot'})-[:MENTIONS]->(e), \
                       (f)-[:BELONGS_TO]->(:User {id: $user_id}) \
                 WHERE f.session_id <> $exclude \
                 RETURN DISTINCT f.content, f.importance, f.created_at, f.session_id \
                 ORDER BY f.importance DESC LIMIT $limit",
                json!({
                    "entities": query.entities,
                    "user_id": user_id,
                    "exclude": exclude,
                    "limit": per_layer,
                }),
            )
            .await?;
        snippets.extend(rows.iter().filter_map(|r| row_snippet(r, RecallLayer::Direct)));

        // Related: one hop out via shared entities.
        let rows = self
            .query(
                "UNWIND $entities AS wanted \
                 MATCH (e:Entity {user_id: $user_id}) \
                 WHERE toLower(e.name) = toLower(wanted) \
                 MATCH (e)<-[:MENTIONS]-(:Fact)-[:MENTIONS]->(other:Entity), \
                       (related:Fact {layer: 'hot'})-[:MENTIONS]->(other), \
                       (related)-[:BELONGS_TO]->(:User {id: $user_id}) \
                 WHERE other.name <> e.name AND related.session_id <> $exclude \
                 RETURN DISTINCT related.content, related.importance, \
                        related.created_at, related.session_id, other.name \
                 LIMIT $limit",
                json!({
                    "entities": query.entities,
                    "user_id": user_id,
                    "exclude": exclude,
                    "limit": per_layer,
                }),
            )
            .await?;
        snippets.extend(rows.iter().filter_map(|r| row_snippet(r, RecallLayer::Related)));

        // Recent window.
        let since = (Utc::now() - chrono::Duration::days(query.recent_days)).to_rfc3339();
        let rows = self
            .query(
                "MATCH (f:Fact {layer: 'hot'})-[:BELONGS_TO]->(:User {id: $user_id}) \
                 WHERE f.created_at > $since AND f.session_id <> $exclude \
                 RETURN f.content, f.importance, f.created_at, f.session_id \
                 ORDER BY f.created_at DESC LIMIT $limit",
                json!({
                    "user_id": user_id,
                    "since": since,
                    "exclude": exclude,
                    "limit": per_layer,
                }),
            )
            .await?;
        snippets.extend(rows.iter().filter_map(|r| row_snippet(r, RecallLayer::Recent)));

        // Drop duplicate contents across layers, keeping the higher layer.
        let mut seen: Vec<String> = Vec::new();
        snippets.retain(|s| {
            if seen.contains(&s.content) {
                false
            } else {
                seen.push(s.content.clone());
                true
            }
        });

        Ok(snippets)
    }

    async fn cluster(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_id(user_id)?;
        let rows = self
            .query(
                "MATCH (u:User {id: $user_id}) \
                 MATCH (e:Entity {user_id: $user_id})<-[:MENTIONS]-(f:Fact {layer: 'hot', clustered: false}) \
                 WHERE (f)-[:BELONGS_TO]->(u) \
                 WITH u, e, collect(f) AS members \
                 WHERE size(members) >= 3 \
                 WITH u, e, members LIMIT $limit \
                 FOREACH (m IN members | SET m.clustered = true) \
                 CREATE (c:Fact {id: randomUUID(), \
                         content: 'About ' + e.name + ': ' + \
                                  reduce(acc = '', m IN members | acc + m.content + ' / '), \
                         hash: randomUUID(), importance: 0.7, layer: 'warm', \
                         created_at: $now, clustered: false, session_id: members[0].session_id}) \
                 CREATE (c)-[:BELONGS_TO]->(u) \
                 CREATE (c)-[:MENTIONS]->(e) \
                 RETURN count(c)",
                json!({
                    "user_id": user_id,
                    "limit": params.max_items as i64,
                    "now": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn summarize(&self, user_id: &str, params: &MaintenanceParams) -> Result<usize> {
        require_user_id(user_id)?;
        let rows = self
            .query(
                "MATCH (f:Fact {layer: 'warm', clustered: false})-[:BELONGS_TO]->(u:User {id: $user_id}) \
                 WITH u, collect(f)[..$limit] AS concepts \
                 WHERE size(concepts) >= 3 \
                 FOREACH (c IN concepts | SET c.clustered = true) \
                 CREATE (s:Fact {id: randomUUID(), \
                         content: 'Summary: ' + \
                                  reduce(acc = '', c IN concepts | acc + c.content + ' | '), \
                         hash: randomUUID(), importance: 0.9, layer: 'cold', \
                         created_at: $now, clustered: false, \
                         session_id: concepts[0].session_id}) \
                 CREATE (s)-[:BELONGS_TO]->(u) \
                 RETURN count(s)",
                json!({
                    "user_id": user_id,
                    "limit": params.max_items as i64,
                    "now": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn decay(&self, user_id: &str, params: &MaintenanceParams) -> Result<DecayOutcome> {
        require_user_id(user_id)?;
        let yesterday = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let rows = self
            .query(
                "MATCH (f:Fact)-[:BELONGS_TO]->(:User {id: $user_id}) \
                 WHERE (f.last_decay IS NULL AND f.created_at < $yesterday) \
                    OR f.last_decay < $yesterday \
                 WITH f LIMIT $limit \
                 SET f.importance = f.importance * \
                     CASE f.layer WHEN 'hot' THEN 0.9 WHEN 'warm' THEN 0.97 ELSE 1.0 END, \
                     f.last_decay = $now \
                 RETURN count(f)",
                json!({
                    "user_id": user_id,
                    "yesterday": yesterday,
                    "now": now,
                    "limit": params.max_items as i64,
                }),
            )
            .await?;
        let decayed = rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        let rows = self
            .query(
                "MATCH (f:Fact)-[:BELONGS_TO]->(:User {id: $user_id}) \
                 WHERE f.importance < 0.05 \
                 DETACH DELETE f \
                 RETURN count(f)",
                json!({"user_id": user_id}),
            )
            .await?;
        let removed = rows
            .first()
            .and_then(|r| r.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        Ok(DecayOutcome { decayed, removed })
    }

    async fn graph_view(&self, user_id: &str, session_id: &str) -> Result<GraphView> {
        require_user_id(user_id)?;
        let mut view = GraphView::default();

        let rows = self
            .query(
                "MATCH (f:Fact {session_id: $session_id})-[:BELONGS_TO]->(:User {id: $user_id}) \
                 RETURN f.id, f.content, f.layer, f.importance",
                json!({"user_id": user_id, "session_id": session_id}),
            )
            .await?;
        for row in &rows {
            view.nodes.push(GraphNode {
                id: row.first().and_then(Value::as_str).unwrap_or_default().into(),
                node_type: "fact".into(),
                content: row.get(1).and_then(Value::as_str).unwrap_or_default().into(),
                layer: row.get(2).and_then(Value::as_str).unwrap_or("hot").into(),
                importance: row.get(3).and_then(Value::as_f64).unwrap_or(0.5) as f32,
            });
        }

        let rows = self
            .query(
                "MATCH (f:Fact {session_id: $session_id})-[:BELONGS_TO]->(:User {id: $user_id}), \
                       (f)-[:MENTIONS]->(e:Entity) \
                 RETURN DISTINCT f.id, e.name",
                json!({"user_id": user_id, "session_id": session_id}),
            )
            .await?;
        for row in &rows {
            let fact_id = row.first().and_then(Value::as_str).unwrap_or_default();
            let entity = row.get(1).and_then(Value::as_str).unwrap_or_default();
            let entity_id = format!("entity:{entity}");
            if !view.nodes.iter().any(|n| n.id == entity_id) {
                view.nodes.push(GraphNode {
                    id: entity_id.clone(),
                    node_type: "entity".into(),
                    content: entity.to_string(),
                    layer: "hot".into(),
                    importance: 0.5,
                });
            }
            view.edges.push(GraphEdge {
                source: fact_id.to_string(),
                target: entity_id,
                edge_type: "MENTIONS".into(),
            });
        }

        Ok(view)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        require_user_id(user_id)?;
        self.query(
            "MATCH (u:User {id: $user_id}) \
             OPTIONAL MATCH (f:Fact)-[:BELONGS_TO]->(u) \
             OPTIONAL MATCH (e:Entity {user_id: $user_id}) \
             DETACH DELETE f, e, u",
            json!({"user_id": user_id}),
        )
        .await?;
        Ok(())
    }

    async fn user_ids(&self) -> Result<Vec<String>> {
        let rows = self.query("MATCH (u:User) RETURN u.id", json!({})).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.query("RETURN 1", json!({})).await.map(|_| ())
    }
}
