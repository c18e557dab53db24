//! Query-side text helpers shared by the stores and the retrieval engine.

const STOP_WORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "your", "yours",
    "yourself", "yourselves", "he", "him", "his", "himself", "she", "her", "hers", "herself",
    "it", "its", "itself", "they", "them", "their", "theirs", "themselves", "this", "that",
    "these", "those", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "a", "an", "the", "and", "but", "if", "or",
    "because", "as", "until", "while", "of", "at", "by", "for", "with", "about", "against",
    "between", "into", "through", "during", "before", "after", "above", "below", "to", "from",
    "up", "down", "in", "out", "on", "off", "over", "under", "again", "further", "then", "once",
    "here", "there", "all", "any", "both", "each", "few", "more", "most", "other", "some",
    "such", "no", "nor", "not", "only", "own", "same", "so", "than", "too", "very", "s", "t",
    "can", "will", "just", "don", "should", "now",
];

const QUESTION_WORDS: &[&str] = &[
    "what", "which", "who", "whom", "when", "where", "whose", "why", "how",
];

const INSTRUCTION_WORDS: &[&str] = &[
    "explain", "describe", "elaborate", "summarize", "examine", "evaluate", "analyze",
    "clarify", "diagnose", "assess",
];

/// Lower-cased alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn is_filler(term: &str) -> bool {
    STOP_WORDS.contains(&term) || QUESTION_WORDS.contains(&term)
}

/// Content terms of a query; falls back to every term when the query is
/// made of stop words only.
pub fn content_terms(text: &str) -> Vec<String> {
    let terms = tokenize(text);
    let content: Vec<String> = terms.iter().filter(|term| !is_filler(term)).cloned().collect();
    if content.is_empty() {
        terms
    } else {
        content
    }
}

/// The text sent to the term index.
pub fn lexical_query(text: &str) -> String {
    content_terms(text).join(" ")
}

/// Whether the query asks for an explanation rather than a lookup.
pub fn is_question(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.ends_with('?') {
        return true;
    }
    tokenize(trimmed).first().is_some_and(|first| {
        QUESTION_WORDS.contains(&first.as_str()) || INSTRUCTION_WORDS.contains(&first.as_str())
    })
}

/// Windows of five words around each term match, joined with " … ", at most
/// `max_words` words. Without a match, the leading `max_words` words.
pub fn snippet_around(text: &str, terms: &[String], max_words: usize) -> String {
    const RADIUS: usize = 5;
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || max_words == 0 {
        return String::new();
    }

    let matches: Vec<usize> = words
        .iter()
        .enumerate()
        .filter(|(_, word)| {
            let normalized = tokenize(word).join("");
            terms.iter().any(|term| *term == normalized)
        })
        .map(|(index, _)| index)
        .collect();

    if matches.is_empty() {
        return words[..words.len().min(max_words)].join(" ");
    }

    let mut windows: Vec<(usize, usize)> = Vec::new();
    for index in matches {
        let start = index.saturating_sub(RADIUS);
        let end = (index + RADIUS + 1).min(words.len());
        match windows.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => windows.push((start, end)),
        }
    }

    let mut pieces = Vec::new();
    let mut used = 0usize;
    for (start, end) in windows {
        if used >= max_words {
            break;
        }
        let end = end.min(start + (max_words - used));
        pieces.push(words[start..end].join(" "));
        used += end - start;
    }
    pieces.join(" … ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_and_question_words_are_dropped() {
        assert_eq!(lexical_query("What is the torque of the M8 bolt?"), "torque m8 bolt");
    }

    #[test]
    fn all_stop_words_query_is_kept() {
        assert_eq!(lexical_query("to be or not"), "to be or not");
    }

    #[test]
    fn questions_are_detected() {
        assert!(is_question("pump pressure?"));
        assert!(is_question("Explain the pump startup"));
        assert!(is_question("how do I bleed the valve"));
        assert!(!is_question("pump pressure table"));
    }

    #[test]
    fn snippet_merges_windows_around_matches() {
        let text = "a b c d e f g pump h i j k l m n o p q r s t u v w pump x";
        let snippet = snippet_around(text, &["pump".to_string()], 40);
        assert_eq!(snippet, "c d e f g pump h i j k l … s t u v w pump x");
    }

    #[test]
    fn snippet_without_match_uses_leading_words() {
        let snippet = snippet_around("one two three four", &["zebra".to_string()], 2);
        assert_eq!(snippet, "one two");
    }

    #[test]
    fn snippet_respects_word_budget() {
        let text = (0..100).map(|i| format!("pump{i} pump")).collect::<Vec<_>>().join(" ");
        let snippet = snippet_around(&text, &["pump".to_string()], 7);
        assert_eq!(snippet.split_whitespace().count(), 7);
    }
}
