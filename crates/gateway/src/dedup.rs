//! Final-text normalization.
//!
//! Some providers occasionally re-emit the same assistant body twice in one
//! response. On end-of-stream the final text is normalized: split into
//! blank-line paragraphs, drop consecutive exact duplicates (compared after
//! whitespace normalization), and when an even-length sequence is two
//! identical halves, keep only the first. The normalized text is what gets
//! committed and what the `done` frame carries — never the raw stream.
//!
//! The pass is idempotent: applying it to its own output changes nothing.

/// Normalize the assistant's final text.
pub fn normalize_final_text(text: &str) -> String {
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if paragraphs.is_empty() {
        return text.trim().to_string();
    }

    // Pass 1: drop consecutive duplicates.
    let mut kept: Vec<&str> = Vec::with_capacity(paragraphs.len());
    for paragraph in paragraphs {
        if kept
            .last()
            .map(|prev| squash(prev) == squash(paragraph))
            .unwrap_or(false)
        {
            continue;
        }
        kept.push(paragraph);
    }

    // Pass 2: a doubled body — the first half equals the second half.
    if kept.len() >= 2 && kept.len() % 2 == 0 {
        let half = kept.len() / 2;
        let doubled = (0..half).all(|i| squash(kept[i]) == squash(kept[i + half]));
        if doubled {
            kept.truncate(half);
        }
    }

    kept.join("\n\n")
}

fn squash(paragraph: &str) -> String {
    paragraph.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubled_body_is_halved() {
        let raw = "Hello.\n\nWorld.\n\nHello.\n\nWorld.";
        assert_eq!(normalize_final_text(raw), "Hello.\n\nWorld.");
    }

    #[test]
    fn consecutive_duplicates_are_dropped() {
        let raw = "Same line.\n\nSame   line.\n\nDifferent.";
        assert_eq!(normalize_final_text(raw), "Same line.\n\nDifferent.");
    }

    #[test]
    fn non_consecutive_repeats_survive_pass_one() {
        // A-B-A is not a doubled body and has no consecutive duplicates.
        let raw = "A.\n\nB.\n\nA.";
        assert_eq!(normalize_final_text(raw), raw);
    }

    #[test]
    fn whitespace_only_difference_counts_as_duplicate() {
        let raw = "One  two\tthree.\n\nOne two three.";
        assert_eq!(normalize_final_text(raw), "One  two\tthree.");
    }

    #[test]
    fn clean_text_is_untouched() {
        let raw = "First paragraph.\n\nSecond paragraph.";
        assert_eq!(normalize_final_text(raw), raw);
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let cases = [
            "Hello.\n\nWorld.\n\nHello.\n\nWorld.",
            "Same.\n\nSame.\n\nSame.",
            "A.\n\nB.\n\nA.\n\nB.",
            "only one paragraph",
            "",
            "x.\n\n\n\nx.",
        ];
        for raw in cases {
            let once = normalize_final_text(raw);
            let twice = normalize_final_text(&once);
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn triple_repeat_collapses_to_one() {
        // Consecutive-dedup handles runs of any length.
        let raw = "Same.\n\nSame.\n\nSame.";
        assert_eq!(normalize_final_text(raw), "Same.");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_final_text(""), "");
        assert_eq!(normalize_final_text("   \n\n  "), "");
    }
}
