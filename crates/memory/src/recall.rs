//! Recall gating and block formatting.
//!
//! Gating decides whether a query is worth a store round-trip at all, and
//! how much context it deserves. The heuristic is intentionally cheap:
//! entity count and query length pick a tier, referential anaphora force
//! recall even for short queries, and greetings skip it entirely.

use crate::extract::{extract_entities, has_anaphora};
use crate::store::{RecallLayer, SearchQuery, Snippet};

/// Recall sizing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallTier {
    Skip,
    Simple,
    Normal,
    Complex,
}

#[derive(Debug, Clone)]
pub struct RecallPlan {
    pub tier: RecallTier,
    pub entities: Vec<String>,
    pub per_layer: usize,
    pub max_chars: usize,
    pub recent_days: i64,
}

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "ok", "okay", "bye", "good morning",
    "good night", "你好", "谢谢",
];

/// Decide whether and how much to recall for one query.
pub fn plan(query: &str) -> RecallPlan {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();
    let entities = extract_entities(trimmed);

    if GREETINGS.contains(&lower.as_str()) || trimmed.is_empty() {
        return RecallPlan {
            tier: RecallTier::Skip,
            entities,
            per_layer: 0,
            max_chars: 0,
            recent_days: 0,
        };
    }

    let anaphoric = has_anaphora(trimmed);
    let length = trimmed.chars().count();

    let tier = if entities.len() >= 3 || length > 80 {
        RecallTier::Complex
    } else if !entities.is_empty() || length > 20 || anaphoric {
        RecallTier::Normal
    } else {
        RecallTier::Simple
    };

    let (per_layer, max_chars, recent_days) = match tier {
        RecallTier::Skip => unreachable!("handled above"),
        RecallTier::Simple => (2, 1200, 3),
        RecallTier::Normal => (3, 2400, 7),
        RecallTier::Complex => (5, 4000, 14),
    };

    RecallPlan {
        tier,
        entities,
        per_layer,
        max_chars,
        recent_days,
    }
}

impl RecallPlan {
    pub fn to_query(&self, text: &str, exclude_session: Option<&str>) -> SearchQuery {
        SearchQuery {
            text: text.to_string(),
            entities: self.entities.clone(),
            per_layer: self.per_layer,
            exclude_session: exclude_session.map(str::to_owned),
            recent_days: self.recent_days,
        }
    }
}

/// Format snippets into the textual recall block prepended to the prompt.
/// Layer order is fixed; a char budget truncates from the bottom. Returns
/// `None` when nothing survived.
pub fn format_block(snippets: &[Snippet], max_chars: usize) -> Option<String> {
    if snippets.is_empty() || max_chars == 0 {
        return None;
    }

    let headers = [
        (RecallLayer::Summary, "[Long-term summaries]"),
        (RecallLayer::Concept, "[Topic concepts]"),
        (RecallLayer::Direct, "[Direct memories]"),
        (RecallLayer::Related, "[Related knowledge]"),
        (RecallLayer::Recent, "[Recent dialog]"),
    ];

    let mut lines: Vec<String> = vec!["[Memory context]".into()];
    let mut used = 0usize;

    for (layer, header) in headers {
        let mut layer_lines: Vec<String> = Vec::new();
        for snip in snippets.iter().filter(|s| s.layer == layer) {
            let date = snip.created_at.format("%m-%d");
            let via = snip
                .via
                .as_deref()
                .map(|v| format!(" (via: {v})"))
                .unwrap_or_default();
            let content = truncate_chars(&snip.content, 160);
            let line = format!("- [{date}] {content}{via}");
            if used + line.len() > max_chars {
                break;
            }
            used += line.len();
            layer_lines.push(line);
        }
        if !layer_lines.is_empty() {
            lines.push(header.to_string());
            lines.append(&mut layer_lines);
        }
    }

    if lines.len() == 1 {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
