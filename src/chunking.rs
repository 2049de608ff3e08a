//! Layout-aware splitting of OCR output into overlapping chunks.
//!
//! The chunker consumes ordered [`TextBlock`]s and produces a finite,
//! ordered sequence of [`ChunkDraft`]s where every chunk fits the configured
//! character budget, consecutive chunks overlap by roughly the configured
//! amount (carried as the last one or two sentences), and — in
//! layout-preserving mode — sentence boundaries are never split while
//! tables, lists, and headings stay atomic when they fit.

use unicode_segmentation::UnicodeSegmentation;

use crate::adapters::{LayoutKind, TextBlock};
use crate::config::ChunkerConfig;

/// A chunk ready for embedding and persistence.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkDraft {
    /// Monotonic position within the document, starting at 0.
    pub sequence: u32,
    pub content: String,
    /// Page of the first block contributing to this chunk.
    pub page: u32,
    /// Dominant layout role of the chunk's content.
    pub layout: LayoutKind,
    /// Minimum OCR confidence among contributing blocks.
    pub confidence: f32,
    /// Whether layout preservation was in effect when this chunk was cut.
    pub preserving_layout: bool,
    /// Character offset of the chunk within the concatenated document text.
    pub offset: usize,
}

/// Splits OCR text blocks into overlapping chunks.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunk the blocks of one document. Empty and whitespace-only content
    /// is discarded; the result may be empty.
    #[must_use]
    pub fn chunk_blocks(&self, blocks: &[TextBlock]) -> Vec<ChunkDraft> {
        let mut acc = Accumulator::new(&self.config);

        for block in blocks {
            let cleaned = clean_block_text(block);
            if cleaned.is_empty() {
                continue;
            }

            if self.config.preserve_layout && block.layout.is_atomic() {
                acc.push_atomic(&cleaned, block);
            } else if self.config.preserve_layout {
                for sentence in split_sentences(&cleaned) {
                    acc.push_unit(sentence, block);
                }
            } else {
                // Plain mode: pack word windows, no sentence guarantees.
                for word in cleaned.split_whitespace() {
                    acc.push_unit(word, block);
                }
            }
        }

        acc.finish()
    }
}

/// Collapse whitespace runs in paragraph text; keep line structure for
/// tables and lists, whose rows are the split boundaries.
fn clean_block_text(block: &TextBlock) -> String {
    match block.layout {
        LayoutKind::Table | LayoutKind::List => block
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        LayoutKind::Paragraph | LayoutKind::Heading => {
            block.text.split_whitespace().collect::<Vec<_>>().join(" ")
        }
    }
}

/// Sentence segmentation over cleaned paragraph text.
fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_sentence_bounds()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ── Accumulator ────────────────────────────────────────────────────────

struct Accumulator<'a> {
    config: &'a ChunkerConfig,
    chunks: Vec<ChunkDraft>,
    content: String,
    page: u32,
    layout: LayoutKind,
    confidence: f32,
    offset: usize,
    /// Recent sentence-sized units kept for overlap carry-over.
    tail_units: Vec<String>,
}

impl<'a> Accumulator<'a> {
    fn new(config: &'a ChunkerConfig) -> Self {
        Self {
            config,
            chunks: Vec::new(),
            content: String::new(),
            page: 0,
            layout: LayoutKind::Paragraph,
            confidence: 1.0,
            offset: 0,
            tail_units: Vec::new(),
        }
    }

    /// Add one indivisible unit (a sentence, or a word in plain mode).
    /// Units longer than the whole chunk budget are hard-split on word
    /// boundaries first.
    fn push_unit(&mut self, unit: &str, block: &TextBlock) {
        if unit.len() > self.config.chunk_size {
            for piece in hard_split(unit, self.config.chunk_size) {
                self.push_fitting_unit(&piece, block);
            }
        } else {
            self.push_fitting_unit(unit, block);
        }
    }

    fn push_fitting_unit(&mut self, unit: &str, block: &TextBlock) {
        let sep = if self.content.is_empty() { 0 } else { 1 };
        if self.content.len() + sep + unit.len() > self.config.chunk_size {
            self.flush_with_overlap();
        }
        if self.content.is_empty() {
            self.page = block.page;
            self.layout = block.layout;
            self.confidence = block.confidence;
        } else {
            self.content.push(' ');
            self.confidence = self.confidence.min(block.confidence);
        }
        self.content.push_str(unit);
        self.tail_units.push(unit.to_string());
        if self.tail_units.len() > 2 {
            self.tail_units.remove(0);
        }
    }

    /// Add an atomic block (table, list, heading). Kept whole when it fits;
    /// split on its row/item boundaries otherwise.
    fn push_atomic(&mut self, cleaned: &str, block: &TextBlock) {
        let sep = if self.content.is_empty() { 0 } else { 1 };
        if self.content.len() + sep + cleaned.len() <= self.config.chunk_size {
            if self.content.is_empty() {
                self.page = block.page;
                self.layout = block.layout;
                self.confidence = block.confidence;
            } else {
                self.content.push('\n');
                self.confidence = self.confidence.min(block.confidence);
            }
            self.content.push_str(cleaned);
            // An atomic block resets the sentence carry; overlap across a
            // table boundary would duplicate rows.
            self.tail_units.clear();
            self.tail_units.push(cleaned.to_string());
            return;
        }

        if cleaned.len() <= self.config.chunk_size {
            self.flush_plain();
            self.page = block.page;
            self.layout = block.layout;
            self.confidence = block.confidence;
            self.content.push_str(cleaned);
            self.tail_units.clear();
            self.tail_units.push(cleaned.to_string());
            return;
        }

        // Oversized atomic block: split on rows/items.
        self.flush_plain();
        for row in cleaned.split('\n') {
            let sep = if self.content.is_empty() { 0 } else { 1 };
            if self.content.len() + sep + row.len() > self.config.chunk_size {
                self.flush_plain();
            }
            if self.content.is_empty() {
                self.page = block.page;
                self.layout = block.layout;
                self.confidence = block.confidence;
            } else {
                self.content.push('\n');
            }
            if row.len() > self.config.chunk_size {
                for piece in hard_split(row, self.config.chunk_size) {
                    if !self.content.is_empty() {
                        self.flush_plain();
                        self.page = block.page;
                        self.layout = block.layout;
                        self.confidence = block.confidence;
                    }
                    self.content.push_str(&piece);
                    self.flush_plain();
                }
            } else {
                self.content.push_str(row);
            }
        }
        self.tail_units.clear();
    }

    /// Cut the current chunk and seed the next with the overlap carry: the
    /// last sentence, or the last two when one alone falls short of the
    /// configured overlap.
    fn flush_with_overlap(&mut self) {
        let carry = self.overlap_carry();
        self.flush_plain();
        if let Some(carry) = carry {
            self.content = carry;
        }
    }

    fn overlap_carry(&self) -> Option<String> {
        if self.config.chunk_overlap == 0 || self.tail_units.is_empty() {
            return None;
        }
        let last = self.tail_units.last()?;
        let carry = if last.len() >= self.config.chunk_overlap || self.tail_units.len() < 2 {
            last.clone()
        } else {
            format!("{} {}", self.tail_units[self.tail_units.len() - 2], last)
        };
        // Never let the carry dominate the next chunk.
        if carry.len() > self.config.chunk_size / 2 {
            return None;
        }
        Some(carry)
    }

    fn flush_plain(&mut self) {
        if self.content.trim().is_empty() {
            self.content.clear();
            return;
        }
        let content = std::mem::take(&mut self.content);
        let sequence = self.chunks.len() as u32;
        let len = content.len();
        self.chunks.push(ChunkDraft {
            sequence,
            content,
            page: self.page,
            layout: self.layout,
            confidence: self.confidence,
            preserving_layout: self.config.preserve_layout,
            offset: self.offset,
        });
        self.offset += len;
        self.confidence = 1.0;
    }

    fn finish(mut self) -> Vec<ChunkDraft> {
        self.flush_plain();
        self.chunks
    }
}

/// Split an oversized unit on word boundaries into pieces within `limit`.
fn hard_split(unit: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for word in unit.split_word_bounds() {
        if current.len() + word.len() > limit && !current.trim().is_empty() {
            pieces.push(std::mem::take(&mut current).trim().to_string());
        }
        if word.len() > limit {
            // Pathological unbroken run: cut at char boundaries.
            let mut start = 0;
            let chars: Vec<(usize, char)> = word.char_indices().collect();
            let mut taken = 0;
            for (idx, c) in &chars {
                if idx - start + c.len_utf8() > limit {
                    pieces.push(word[start..*idx].to_string());
                    start = *idx;
                }
                taken = idx + c.len_utf8();
            }
            if start < taken {
                current.push_str(&word[start..]);
            }
        } else {
            current.push_str(word);
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(text: &str, page: u32) -> TextBlock {
        TextBlock::new(text, page, LayoutKind::Paragraph, 0.95)
    }

    fn default_chunker() -> Chunker {
        Chunker::new(ChunkerConfig::default())
    }

    fn small_chunker(chunk_size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            chunk_size,
            chunk_overlap: overlap,
            preserve_layout: true,
        })
    }

    #[test]
    fn empty_and_whitespace_blocks_are_discarded() {
        let chunker = default_chunker();
        let blocks = vec![
            paragraph("", 1),
            paragraph("   \n\t  ", 1),
        ];
        assert!(chunker.chunk_blocks(&blocks).is_empty());
    }

    #[test]
    fn sequences_are_monotonic_from_zero() {
        let chunker = small_chunker(80, 20);
        let text = "First sentence here. Second sentence follows. Third one too. \
                    Fourth sentence now. Fifth sentence ends it. Sixth for measure."
            .to_string();
        let chunks = chunker.chunk_blocks(&[paragraph(&text, 1)]);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u32);
            assert!(chunk.content.len() <= 80, "chunk {i} over budget");
        }
    }

    #[test]
    fn consecutive_chunks_share_sentence_overlap() {
        let chunker = small_chunker(100, 30);
        let text = "Alpha sentence one goes here. Beta sentence two goes here. \
                    Gamma sentence three goes here. Delta sentence four goes here.";
        let chunks = chunker.chunk_blocks(&[paragraph(text, 1)]);
        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0]
                .content
                .chars()
                .rev()
                .take(60)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            // The next chunk must start with a sentence carried from the
            // previous chunk's tail.
            let head: String = pair[1].content.chars().take(20).collect();
            assert!(
                prev_tail.contains(head.trim_end_matches(|c: char| !c.is_alphanumeric())),
                "no overlap between '{}' and '{}'",
                pair[0].content,
                pair[1].content
            );
        }
    }

    #[test]
    fn sentences_are_never_split_in_layout_mode() {
        let chunker = small_chunker(90, 20);
        let text = "One short sentence. Another short sentence right after. \
                    A third sentence completes the set. And a fourth closes out.";
        let chunks = chunker.chunk_blocks(&[paragraph(text, 1)]);
        for chunk in &chunks {
            // Every chunk ends on a sentence boundary.
            let trimmed = chunk.content.trim_end();
            assert!(
                trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('?'),
                "chunk split mid-sentence: '{trimmed}'"
            );
        }
    }

    #[test]
    fn fitting_table_stays_atomic() {
        let chunker = small_chunker(200, 20);
        let table = TextBlock::new(
            "Model | Flow | Pressure\nA123 | 500 GPM | 150 PSI\nB456 | 320 GPM | 90 PSI",
            2,
            LayoutKind::Table,
            0.9,
        );
        let blocks = vec![
            paragraph("Catalogue of industrial pumps follows below here now.", 1),
            table,
        ];
        let chunks = chunker.chunk_blocks(&blocks);
        let table_chunk = chunks
            .iter()
            .find(|c| c.content.contains("A123"))
            .expect("table chunk");
        assert!(table_chunk.content.contains("B456"), "table was split");
    }

    #[test]
    fn oversized_table_splits_on_rows() {
        let rows: Vec<String> = (0..30)
            .map(|i| format!("Row-{i:02} | value-{i:02} | detail-{i:02}"))
            .collect();
        let table = TextBlock::new(rows.join("\n"), 1, LayoutKind::Table, 0.9);
        let chunker = small_chunker(120, 20);
        let chunks = chunker.chunk_blocks(&[table]);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 120);
            // Every line inside remains a complete row.
            for line in chunk.content.lines() {
                assert!(line.starts_with("Row-"), "row was split: '{line}'");
            }
        }
    }

    #[test]
    fn page_and_layout_metadata_recorded() {
        let chunker = default_chunker();
        let blocks = vec![
            TextBlock::new("Specifications", 3, LayoutKind::Heading, 0.99),
            paragraph("The pump operates at a nominal flow rate.", 3),
        ];
        let chunks = chunker.chunk_blocks(&blocks);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page, 3);
        assert!(chunks[0].preserving_layout);
        assert!((chunks[0].confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn plain_mode_packs_by_words() {
        let chunker = Chunker::new(ChunkerConfig {
            chunk_size: 40,
            chunk_overlap: 0,
            preserve_layout: false,
        });
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = chunker.chunk_blocks(&[paragraph(text, 1)]);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.content.len() <= 40);
            assert!(!chunk.preserving_layout);
        }
    }
}
