//! Token-bounded, context-enriched chunking.
//!
//! Text is split into sections at headings. Each section is cut into sliding
//! windows of words whose token cost fits the model's input limit after the
//! `"{title} > {section}"` context line is prepended. Consecutive windows of a
//! section share `overlap_tokens` worth of words; a new section starts fresh.
//!
//! Token costs come from a [`TokenCounter`]. [`ModelTokenCounter`] wraps the
//! embedding model's own `tokenizer.json`; the word and character estimates
//! are for the local n-gram embedder, which has no tokenizer.

use crate::error::IngestError;
use crate::models::{chunk_id, Chunk, DocumentRecord};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

/// Measures text in the embedding model's tokenization units.
///
/// Implementations must be additive over whitespace-separated words: the count
/// of `"a b"` equals the count of `"a"` plus the count of `"b"`. The chunker
/// relies on this to enforce the bound word by word.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Tokens the model adds to every input, such as `[CLS]` and `[SEP]`.
    fn reserved(&self) -> usize {
        0
    }
}

/// Counts with the embedding model's tokenizer.
///
/// Each whitespace-separated word is encoded on its own, without special
/// tokens, which keeps the count additive. For tokenizers that pre-split on
/// whitespace (WordPiece, Metaspace) this equals the count of the whole text.
#[derive(Clone)]
pub struct ModelTokenCounter {
    tokenizer: Arc<Tokenizer>,
    reserved: usize,
}

impl std::fmt::Debug for ModelTokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelTokenCounter")
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

impl ModelTokenCounter {
    /// Loads a Hugging Face `tokenizer.json`.
    pub fn from_file(path: &Path) -> Result<Self, IngestError> {
        if !path.exists() {
            return Err(IngestError::Tokenizer(format!(
                "tokenizer not found at {}",
                path.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(path).map_err(|error| {
            IngestError::Tokenizer(format!("failed to load {}: {error}", path.display()))
        })?;
        Self::from_tokenizer(tokenizer)
    }

    /// Truncation and padding from the tokenizer file are switched off so
    /// counts are never capped or inflated.
    pub fn from_tokenizer(mut tokenizer: Tokenizer) -> Result<Self, IngestError> {
        tokenizer
            .with_truncation(None)
            .map_err(|error| IngestError::Tokenizer(error.to_string()))?;
        tokenizer.with_padding(None);

        let reserved = tokenizer
            .encode("", true)
            .map_err(|error| IngestError::Tokenizer(error.to_string()))?
            .len();

        Ok(Self {
            tokenizer: Arc::new(tokenizer),
            reserved,
        })
    }

    fn count_word(&self, word: &str) -> usize {
        match self.tokenizer.encode(word, false) {
            Ok(encoding) => encoding.len(),
            // One token per char bounds every vocabulary that has an [UNK].
            Err(_) => word.chars().count(),
        }
    }
}

impl TokenCounter for ModelTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().map(|word| self.count_word(word)).sum()
    }

    fn reserved(&self) -> usize {
        self.reserved
    }
}

/// One token per whitespace-separated word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Sub-word estimate: each word costs `ceil(chars / chars_per_token)` tokens.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenCounter {
    pub chars_per_token: usize,
}

impl Default for CharRatioTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for CharRatioTokenCounter {
    fn count(&self, text: &str) -> usize {
        let ratio = self.chars_per_token.max(1);
        text.split_whitespace()
            .map(|word| word.chars().count().div_ceil(ratio))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Upper bound for a chunk's token count, context line included.
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 64,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_tokens must be greater than zero".to_string(),
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cleans extracted text while keeping line structure for heading detection.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.replace("<missing-text>", "").lines() {
        let line = normalize_whitespace(line);
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !cleaned.is_empty() {
            cleaned.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        cleaned.push_str(&line);
        blank_run = 0;
    }

    cleaned
}

const MARKUP_HEADING: &str = r"^(#{1,6}|={1,6})\s+(.+?)\s*#*$";
const NUMBERED_HEADING: &str = r"^(\d+(?:\.\d+)*)\.?\s+([A-Z][^.!?:;]{0,80})$";

#[derive(Debug, Clone)]
struct HeadingMatcher {
    markup: Regex,
    numbered: Regex,
}

impl HeadingMatcher {
    fn new() -> Result<Self, IngestError> {
        Ok(Self {
            markup: Regex::new(MARKUP_HEADING)?,
            numbered: Regex::new(NUMBERED_HEADING)?,
        })
    }

    /// Returns `(level, heading)` when the line is a section heading.
    fn parse(&self, line: &str) -> Option<(usize, String)> {
        if let Some(captures) = self.markup.captures(line) {
            let level = captures.get(1)?.as_str().len();
            let heading = captures.get(2)?.as_str().trim().to_string();
            return (!heading.is_empty()).then_some((level, heading));
        }

        let captures = self.numbered.captures(line)?;
        let level = captures.get(1)?.as_str().split('.').count();
        Some((level, line.trim().to_string()))
    }
}

#[derive(Debug)]
struct Section {
    path: Vec<String>,
    words: Vec<String>,
}

fn split_sections(headings: &HeadingMatcher, text: &str, base_section: Option<&str>) -> Vec<Section> {
    let base: Vec<String> = base_section
        .map(|section| section.trim())
        .filter(|section| !section.is_empty())
        .map(|section| vec![section.to_string()])
        .unwrap_or_default();

    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut sections = vec![Section {
        path: base.clone(),
        words: Vec::new(),
    }];

    for line in text.lines() {
        if let Some((level, heading)) = headings.parse(line) {
            while stack.last().is_some_and(|(open, _)| *open >= level) {
                stack.pop();
            }
            stack.push((level, heading));

            let mut path = base.clone();
            path.extend(stack.iter().map(|(_, heading)| heading.clone()));
            sections.push(Section {
                path,
                words: Vec::new(),
            });
            continue;
        }

        if let Some(current) = sections.last_mut() {
            current
                .words
                .extend(line.split_whitespace().map(str::to_string));
        }
    }

    sections.retain(|section| !section.words.is_empty());

    if sections.is_empty() && !text.trim().is_empty() {
        // Headings only: keep them as body so the document still yields a chunk.
        sections.push(Section {
            path: base,
            words: text.split_whitespace().map(str::to_string).collect(),
        });
    }

    sections
}

/// Ordered chunks of one document; consumed once.
#[derive(Debug)]
pub struct Chunks {
    inner: std::vec::IntoIter<Chunk>,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks {}

#[derive(Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    counter: Arc<dyn TokenCounter>,
    headings: HeadingMatcher,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    pub fn new(config: ChunkingConfig, counter: Arc<dyn TokenCounter>) -> Result<Self, IngestError> {
        config.validate()?;
        if counter.reserved() >= config.max_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "max_tokens ({}) leaves no room after the {} tokens the model reserves",
                config.max_tokens,
                counter.reserved()
            )));
        }
        Ok(Self {
            config,
            counter,
            headings: HeadingMatcher::new()?,
        })
    }

    pub fn with_whitespace_tokens(config: ChunkingConfig) -> Result<Self, IngestError> {
        Self::new(config, Arc::new(WhitespaceTokenCounter))
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Chunks `text` for `document`. `section_path` seeds the section context
    /// when the extractor knows where the text sits in a larger structure.
    pub fn chunk(&self, document: &DocumentRecord, text: &str, section_path: Option<&str>) -> Chunks {
        let mut chunks = Vec::new();
        let reserved = self.counter.reserved();
        let usable = self.config.max_tokens - reserved;

        for section in split_sections(&self.headings, text, section_path) {
            let context = self.fit_context(&document.title, &section.path, usable);
            let context_tokens = reserved + self.counter.count(&context);
            let budget = self.config.max_tokens.saturating_sub(context_tokens).max(1);
            let overlap = self.config.overlap_tokens.min(budget.saturating_sub(1));

            let words = self.split_oversized(section.words, budget);
            let costs: Vec<usize> = words.iter().map(|word| self.counter.count(word)).collect();

            let mut start = 0usize;
            let mut overlap_prev = 0usize;
            while start < words.len() {
                let mut end = start;
                let mut body_tokens = 0usize;
                while end < words.len() && body_tokens + costs[end] <= budget {
                    body_tokens += costs[end];
                    end += 1;
                }
                if end == start {
                    end = start + 1;
                    body_tokens = costs[start];
                }

                let mut next_start = end;
                let mut overlap_next = 0usize;
                if end < words.len() {
                    while next_start > start + 1 && overlap_next + costs[next_start - 1] <= overlap {
                        overlap_next += costs[next_start - 1];
                        next_start -= 1;
                    }
                }

                let body = words[start..end].join(" ");
                let text = if context.is_empty() {
                    body.clone()
                } else {
                    format!("{context}\n{body}")
                };
                let chunk_index = chunks.len() as u32;

                chunks.push(Chunk {
                    chunk_id: chunk_id(&document.document_id, chunk_index),
                    document_id: document.document_id.clone(),
                    chunk_index,
                    context: context.clone(),
                    body,
                    text,
                    token_count: context_tokens + body_tokens,
                    overlap_prev,
                    overlap_next,
                });

                overlap_prev = overlap_next;
                start = next_start;
            }
        }

        Chunks {
            inner: chunks.into_iter(),
        }
    }

    /// Builds the context line, dropping trailing words until it costs at most
    /// half of the `usable` tokens.
    fn fit_context(&self, title: &str, path: &[String], usable: usize) -> String {
        let mut parts = Vec::with_capacity(path.len() + 1);
        if !title.trim().is_empty() {
            parts.push(normalize_whitespace(title));
        }
        parts.extend(
            path.iter()
                .map(|segment| normalize_whitespace(segment))
                .filter(|segment| !segment.eq_ignore_ascii_case(title.trim())),
        );
        let full = parts.join(" > ");

        let limit = usable / 2;
        if self.counter.count(&full) <= limit {
            return full;
        }

        let mut kept = String::new();
        let mut used = 0usize;
        for word in full.split_whitespace() {
            let cost = self.counter.count(word);
            if used + cost > limit {
                break;
            }
            if !kept.is_empty() {
                kept.push(' ');
            }
            kept.push_str(word);
            used += cost;
        }
        kept
    }

    /// Hard-splits words whose own cost exceeds `budget` on char boundaries.
    fn split_oversized(&self, words: Vec<String>, budget: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(words.len());
        for word in words {
            if self.counter.count(&word) <= budget {
                out.push(word);
                continue;
            }

            let chars: Vec<char> = word.chars().collect();
            let mut start = 0usize;
            while start < chars.len() {
                // Largest prefix of the remainder that fits, by binary search.
                let (mut low, mut high) = (start + 1, chars.len());
                while low < high {
                    let mid = (low + high).div_ceil(2);
                    let piece: String = chars[start..mid].iter().collect();
                    if self.counter.count(&piece) <= budget {
                        low = mid;
                    } else {
                        high = mid - 1;
                    }
                }
                out.push(chars[start..low].iter().collect());
                start = low;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionStatus;

    fn document(title: &str) -> DocumentRecord {
        DocumentRecord {
            document_id: "doc-1".to_string(),
            source_path: "/tmp/test.md".to_string(),
            title: title.to_string(),
            modified_at: chrono::Utc::now(),
            fingerprint: "checksum".to_string(),
            status: ExtractionStatus::Extracted,
        }
    }

    fn numbered_words(count: usize) -> String {
        (0..count).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn clean_text_drops_placeholders_and_keeps_paragraphs() {
        let cleaned = clean_text("# Intro  \n<missing-text>\n\n\n\nfirst\u{a0} line\nsecond");
        assert_eq!(cleaned, "# Intro\n\nfirst line\nsecond");
    }

    #[test]
    fn whitespace_only_text_yields_no_chunks() {
        let chunker = Chunker::with_whitespace_tokens(ChunkingConfig::default()).unwrap();
        assert_eq!(chunker.chunk(&document("T"), "  \n\t ", None).count(), 0);
    }

    #[test]
    fn short_document_yields_one_enriched_chunk() {
        let chunker = Chunker::with_whitespace_tokens(ChunkingConfig::default()).unwrap();
        let chunks: Vec<_> = chunker
            .chunk(&document("Pump Manual"), "The pump runs at 40 psi.", None)
            .collect();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].chunk_id, "doc-1-0");
        assert_eq!(chunks[0].context, "Pump Manual");
        assert_eq!(chunks[0].text, "Pump Manual\nThe pump runs at 40 psi.");
        assert_eq!(chunks[0].token_count, 8);
    }

    #[test]
    fn long_section_is_windowed_in_order_within_bound() {
        let config = ChunkingConfig {
            max_tokens: 12,
            overlap_tokens: 3,
        };
        let chunker = Chunker::with_whitespace_tokens(config).unwrap();
        let text = numbered_words(50);
        let chunks: Vec<_> = chunker.chunk(&document("Title"), &text, None).collect();

        assert!(chunks.len() > 1);
        for (expected, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index as usize, expected);
            assert!(chunk.token_count <= config.max_tokens);
            assert_eq!(WhitespaceTokenCounter.count(&chunk.text), chunk.token_count);
            assert!(chunk.text.starts_with("Title\n"));
        }

        for pair in chunks.windows(2) {
            let previous: Vec<&str> = pair[0].body.split_whitespace().collect();
            let next: Vec<&str> = pair[1].body.split_whitespace().collect();
            assert_eq!(pair[0].overlap_next, 3);
            assert_eq!(pair[1].overlap_prev, 3);
            assert_eq!(previous[previous.len() - 3..], next[..3]);
        }

        // Bodies minus overlaps reassemble the source.
        let mut rebuilt: Vec<&str> = Vec::new();
        for chunk in &chunks {
            rebuilt.extend(chunk.body.split_whitespace().skip(chunk.overlap_prev));
        }
        assert_eq!(rebuilt.join(" "), text);
    }

    #[test]
    fn headings_become_section_context() {
        let chunker = Chunker::with_whitespace_tokens(ChunkingConfig::default()).unwrap();
        let text = "# Install\n\nUnpack the kit.\n\n## Wiring\n\nConnect red to red.\n\n# Care\n\nWipe weekly.";
        let chunks: Vec<_> = chunker.chunk(&document("Guide"), text, None).collect();

        let contexts: Vec<&str> = chunks.iter().map(|chunk| chunk.context.as_str()).collect();
        assert_eq!(
            contexts,
            vec!["Guide > Install", "Guide > Install > Wiring", "Guide > Care"]
        );
        assert_eq!(chunks[1].body, "Connect red to red.");
        assert_eq!(chunks[2].overlap_prev, 0);
    }

    #[test]
    fn heading_repeating_the_title_is_not_duplicated() {
        let chunker = Chunker::with_whitespace_tokens(ChunkingConfig::default()).unwrap();
        let chunks: Vec<_> = chunker
            .chunk(&document("Guide"), "# Guide\n\nIntro text.\n\n## Setup\n\nSteps.", None)
            .collect();
        assert_eq!(chunks[0].context, "Guide");
        assert_eq!(chunks[1].context, "Guide > Setup");
    }

    #[test]
    fn extractor_section_path_seeds_context() {
        let chunker = Chunker::with_whitespace_tokens(ChunkingConfig::default()).unwrap();
        let chunks: Vec<_> = chunker
            .chunk(&document("Sheet"), "cell values here", Some("Summary tab"))
            .collect();
        assert_eq!(chunks[0].context, "Sheet > Summary tab");
    }

    #[test]
    fn oversized_word_is_hard_split() {
        let config = ChunkingConfig {
            max_tokens: 8,
            overlap_tokens: 0,
        };
        let chunker = Chunker::new(config, Arc::new(CharRatioTokenCounter::default())).unwrap();
        let word = "x".repeat(100);
        let chunks: Vec<_> = chunker.chunk(&document("T"), &word, None).collect();

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= 8, "chunk {} too long", chunk.chunk_index);
        }
        let rebuilt: String = chunks.iter().map(|chunk| chunk.body.as_str()).collect();
        assert_eq!(rebuilt, word);
    }

    #[test]
    fn long_title_is_truncated_to_half_the_budget() {
        let config = ChunkingConfig {
            max_tokens: 10,
            overlap_tokens: 2,
        };
        let chunker = Chunker::with_whitespace_tokens(config).unwrap();
        let title = numbered_words(30);
        let chunks: Vec<_> = chunker.chunk(&document(&title), "body words here", None).collect();

        assert_eq!(chunks.len(), 1);
        assert_eq!(WhitespaceTokenCounter.count(&chunks[0].context), 5);
        assert!(chunks[0].token_count <= 10);
    }

    #[test]
    fn overlap_must_be_smaller_than_max() {
        let config = ChunkingConfig {
            max_tokens: 10,
            overlap_tokens: 10,
        };
        assert!(matches!(
            Chunker::with_whitespace_tokens(config),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    fn wordpiece() -> Tokenizer {
        let json = r###"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "BertPreTokenizer"},
            "post_processor": {"type": "BertProcessing", "sep": ["[SEP]", 1], "cls": ["[CLS]", 0]},
            "decoder": null,
            "model": {
                "type": "WordPiece",
                "unk_token": "[UNK]",
                "continuing_subword_prefix": "##",
                "max_input_chars_per_word": 100,
                "vocab": {
                    "[CLS]": 0, "[SEP]": 1, "[UNK]": 2, "pump": 3, "##s": 4,
                    "seal": 5, "##ing": 6, "guide": 7, ">": 8, "1": 9, ",": 10, "234": 11
                }
            }
        }"###;
        Tokenizer::from_bytes(json.as_bytes()).unwrap()
    }

    #[test]
    fn model_counter_uses_subword_pieces() {
        let counter = ModelTokenCounter::from_tokenizer(wordpiece()).unwrap();
        assert_eq!(counter.reserved(), 2);
        assert_eq!(counter.count("pumps"), 2);
        assert_eq!(counter.count("1,234"), 3);
        assert_eq!(counter.count("pumps sealing"), 4);
        assert_eq!(counter.count("unheard"), 1);
    }

    #[test]
    fn model_counted_chunks_fit_the_model_input() {
        let tokenizer = wordpiece();
        let config = ChunkingConfig {
            max_tokens: 10,
            overlap_tokens: 2,
        };
        let counter = ModelTokenCounter::from_tokenizer(tokenizer.clone()).unwrap();
        let chunker = Chunker::new(config, Arc::new(counter)).unwrap();
        let text = vec!["pumps sealing"; 10].join(" ");
        let chunks: Vec<_> = chunker.chunk(&document("guide"), &text, None).collect();

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let encoded = tokenizer.encode(chunk.text.as_str(), true).unwrap().len();
            assert_eq!(encoded, chunk.token_count);
            assert!(encoded <= config.max_tokens, "chunk {} too long", chunk.chunk_index);
        }
    }

    #[test]
    fn reserved_tokens_must_leave_room() {
        let config = ChunkingConfig {
            max_tokens: 2,
            overlap_tokens: 0,
        };
        let counter = ModelTokenCounter::from_tokenizer(wordpiece()).unwrap();
        assert!(matches!(
            Chunker::new(config, Arc::new(counter)),
            Err(IngestError::InvalidChunkConfig(_))
        ));
    }

    #[test]
    fn missing_tokenizer_file_is_reported() {
        let result = ModelTokenCounter::from_file(Path::new("/nonexistent/tokenizer.json"));
        assert!(matches!(result, Err(IngestError::Tokenizer(_))));
    }

    #[test]
    fn char_ratio_counter_rounds_up_per_word() {
        let counter = CharRatioTokenCounter::default();
        assert_eq!(counter.count("abcd abcde a"), 1 + 2 + 1);
    }
}
