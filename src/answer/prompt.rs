//! Prompt assembly: system prompt, bounded chat history, and retrieved
//! context packed in score order under a token budget.

use crate::config::QueryConfig;
use crate::search::SearchHit;
use crate::store::MessageRole;

/// System prompt sent with every completion.
pub const SYSTEM_PROMPT: &str = "You are an assistant for a product catalog search service. \
     Provide accurate responses based on the given context. \
     Only use information from the provided context.";

/// One prior conversation turn.
#[derive(Clone, Debug)]
pub struct HistoryTurn {
    pub role: MessageRole,
    pub content: String,
}

/// A fully assembled prompt plus bookkeeping about what made it in.
#[derive(Clone, Debug)]
pub struct AssembledPrompt {
    pub system: String,
    pub prompt: String,
    /// Indices into the hit slice for chunks that fit the budget.
    pub included: Vec<usize>,
    /// Maximum similarity score among included chunks; 0 when none fit.
    pub confidence: f32,
}

/// Chars-per-token heuristic used for the context budget.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Builds prompts under the configured windows.
pub struct PromptAssembler {
    config: QueryConfig,
}

impl PromptAssembler {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    /// Assemble the prompt for a query.
    ///
    /// Chunks are added in score order until the token budget is exhausted;
    /// a chunk that does not fully fit is never truncated mid-sentence — it
    /// and everything after it are left out. History keeps whole turns,
    /// newest backwards, within the character window.
    #[must_use]
    pub fn assemble(
        &self,
        query: &str,
        history: &[HistoryTurn],
        hits: &[SearchHit],
    ) -> AssembledPrompt {
        let mut included = Vec::new();
        let mut context_parts: Vec<&str> = Vec::new();
        let mut budget = self.config.context_window_tokens;
        let mut confidence = 0.0_f32;

        for (idx, hit) in hits.iter().enumerate() {
            let cost = estimate_tokens(&hit.chunk.content) + 1;
            if cost > budget {
                break;
            }
            budget -= cost;
            context_parts.push(&hit.chunk.content);
            confidence = confidence.max(hit.score);
            included.push(idx);
        }

        let context = if context_parts.is_empty() {
            "No relevant documents found.".to_string()
        } else {
            context_parts.join("\n")
        };

        let history_text = self.history_window(history);
        let prompt = format!(
            "Context: {context}\n\n\
             Chat History: {history_text}\n\n\
             User Query: {query}\n\n\
             Please provide a detailed and accurate response based on the given context."
        );

        AssembledPrompt {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            included,
            confidence,
        }
    }

    /// The most recent whole turns that fit the history character window,
    /// rendered oldest-first as `role: content` lines.
    fn history_window(&self, history: &[HistoryTurn]) -> String {
        if history.is_empty() {
            return "No previous context".to_string();
        }
        let mut kept: Vec<String> = Vec::new();
        let mut used = 0usize;
        for turn in history.iter().rev() {
            let line = format!("{}: {}", turn.role.as_str(), turn.content);
            if used + line.len() > self.config.history_window_chars && !kept.is_empty() {
                break;
            }
            if line.len() > self.config.history_window_chars && kept.is_empty() {
                // A single oversized turn: keep its tail so the newest
                // exchange is never dropped entirely.
                let tail: String = line
                    .chars()
                    .skip(line.chars().count() - self.config.history_window_chars)
                    .collect();
                kept.push(tail);
                break;
            }
            used += line.len();
            kept.push(line);
        }
        kept.reverse();
        kept.join("\n")
    }
}
