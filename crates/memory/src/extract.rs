//! Salient-fact and entity extraction.
//!
//! Lightweight rule-based heuristics: good enough to gate recall and to
//! pick which sentences of a turn are worth remembering, with no model
//! call on the hot path.

/// Words that look like entities but carry no recall value.
const STOPWORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "There", "What", "When", "Where", "Which", "Who",
    "Why", "How", "And", "But", "For", "Not", "You", "Your", "Yes", "Okay", "Please", "Thanks",
    "Hello", "Today", "Tomorrow", "Yesterday", "My", "Mine", "Our", "His", "Her", "Their",
];

/// Anaphora that reference earlier conversation; their presence is a strong
/// recall signal ("how old am I?", "what did it say?").
const ANAPHORA: &[&str] = &[
    " i ", " me ", " my ", " mine ", " it ", " that ", " this ", " them ", " those ", " earlier ",
    " before ", " again ", " last time ", " previous ",
];

/// Extract candidate entities: capitalized multi-letter tokens (minus
/// stopwords), numbers, and quoted spans.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();

    for token in text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '-')) {
        let token = token.trim_matches('\'');
        if token.len() < 2 {
            continue;
        }
        let is_capitalized = token.chars().next().map(char::is_uppercase).unwrap_or(false)
            && token.chars().any(char::is_lowercase);
        let is_number = token.chars().all(|c| c.is_ascii_digit());
        if (is_capitalized && !STOPWORDS.contains(&token)) || is_number {
            let owned = token.to_string();
            if !entities.contains(&owned) {
                entities.push(owned);
            }
        }
    }

    // Quoted spans are entities verbatim.
    let mut rest = text;
    while let Some(start) = rest.find('"') {
        let Some(len) = rest[start + 1..].find('"') else {
            break;
        };
        let span = rest[start + 1..start + 1 + len].trim();
        if !span.is_empty() && span.len() <= 60 && !entities.iter().any(|e| e == span) {
            entities.push(span.to_string());
        }
        rest = &rest[start + 1 + len + 1..];
    }

    entities
}

/// Does the query lean on conversational context rather than stating it?
pub fn has_anaphora(text: &str) -> bool {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let padded = format!(" {normalized} ");
    ANAPHORA.iter().any(|a| padded.contains(a))
}

/// Pick the sentences of a committed turn worth storing as facts.
///
/// User sentences win when they are self-descriptive (first person) or
/// entity-bearing; assistant sentences only when they carry entities, and
/// fewer of them — the user's own statements are the durable signal.
pub fn extract_facts(user_text: &str, assistant_text: &str) -> Vec<(String, Vec<String>)> {
    let mut facts = Vec::new();

    for sentence in split_sentences(user_text) {
        let entities = extract_entities(&sentence);
        if is_first_person(&sentence) || !entities.is_empty() {
            facts.push((sentence, entities));
        }
    }

    for sentence in split_sentences(assistant_text).into_iter().take(2) {
        let entities = extract_entities(&sentence);
        if entities.len() >= 2 {
            facts.push((sentence, entities));
        }
    }

    facts.truncate(8);
    facts
}

fn is_first_person(sentence: &str) -> bool {
    let lower = format!(" {} ", sentence.to_lowercase());
    ["i am", "i'm", " my ", " i ", "i have", "i like", "i live", "call me"]
        .iter()
        .any(|m| lower.contains(m))
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(|c| matches!(c, '.' | '!' | '?' | '\n' | '。' | '！' | '？'))
        .map(str::trim)
        .filter(|s| s.len() >= 8)
        .map(str::to_string)
        .collect()
}
