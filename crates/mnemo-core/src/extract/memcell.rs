//! Episode boundary detection
//!
//! Decides whether the accumulated window of a group ends a conversational
//! episode. The decision is delegated to the LLM; its JSON verdict is parsed
//! strictly and every failure mode degrades to `Wait` so the ingest state
//! machine never advances on garbage.

use chrono::SecondsFormat;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::memory::{MemCell, RawMessage};
use crate::providers::ChatModel;

use super::parse_json_block;

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of one boundary-detection pass
#[derive(Debug)]
pub enum ExtractOutcome {
    /// An episode ended; the cell covers a prefix of the window
    Emit(MemCell),
    /// No boundary yet; the window keeps accumulating
    Accumulate,
    /// Evidence insufficient (or the oracle misbehaved); hold the window
    Wait,
}

impl ExtractOutcome {
    /// Whether the coordinator should freeze the cursor this round
    pub fn should_wait(&self) -> bool {
        matches!(self, ExtractOutcome::Wait)
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tunables for the boundary detector
#[derive(Debug, Clone)]
pub struct MemCellExtractorConfig {
    /// Window length above which the oldest messages are masked as context
    pub smart_mask_threshold: usize,
    /// Transport-level retry attempts before giving up with `Wait`
    pub max_attempts: usize,
}

impl Default for MemCellExtractorConfig {
    fn default() -> Self {
        Self {
            smart_mask_threshold: 5,
            max_attempts: 5,
        }
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// The LLM's boundary verdict
#[derive(Debug, Deserialize)]
struct BoundaryDecision {
    /// Whether an episode boundary was found
    #[serde(default)]
    boundary: bool,
    /// Index of the last covered message (0-based, into the numbered window)
    #[serde(default)]
    boundary_index: Option<usize>,
    /// One-sentence episode summary
    #[serde(default)]
    summary: Option<String>,
    /// Explicit "cannot judge yet" signal
    #[serde(default)]
    wait: bool,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// LLM-guided episode boundary detector
pub struct MemCellExtractor {
    chat: Arc<dyn ChatModel>,
    config: MemCellExtractorConfig,
}

impl MemCellExtractor {
    /// Build a detector over a chat model
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self::with_config(chat, MemCellExtractorConfig::default())
    }

    /// Build with explicit tunables
    pub fn with_config(chat: Arc<dyn ChatModel>, config: MemCellExtractorConfig) -> Self {
        Self { chat, config }
    }

    /// Decide whether the window `history ++ new` ends an episode.
    ///
    /// `history` provides context; only messages in the combined window can
    /// be covered. Returns `Emit` with a MemCell whose `original_data` is
    /// the covered prefix, `Accumulate` when no boundary exists yet, and
    /// `Wait` on inconclusive or malformed oracle output.
    pub async fn extract(
        &self,
        history: &[RawMessage],
        new: &[RawMessage],
        group_id: Option<&str>,
        user_id_list: &[String],
    ) -> ExtractOutcome {
        let window: Vec<&RawMessage> = history.iter().chain(new.iter()).collect();
        if window.is_empty() || new.is_empty() {
            return ExtractOutcome::Accumulate;
        }

        let smart_mask = window.len() > self.config.smart_mask_threshold;
        let prompt = self.boundary_prompt(&window, smart_mask);

        let mut parse_failures = 0;
        for attempt in 0..self.config.max_attempts {
            let response = match self.chat.generate(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Boundary detection attempt {} failed: {e}", attempt + 1);
                    continue;
                }
            };

            let Some(decision) = parse_json_block::<BoundaryDecision>(&response) else {
                parse_failures += 1;
                if parse_failures >= 2 {
                    warn!("Boundary verdict unparseable twice; holding window");
                    return ExtractOutcome::Wait;
                }
                continue;
            };

            if decision.wait {
                return ExtractOutcome::Wait;
            }
            if !decision.boundary {
                return ExtractOutcome::Accumulate;
            }

            let Some(index) = decision.boundary_index else {
                return ExtractOutcome::Wait;
            };
            if index >= window.len() {
                warn!(
                    "Boundary index {index} out of range for window of {}",
                    window.len()
                );
                return ExtractOutcome::Wait;
            }

            return self.build_cell(&window, index, decision.summary, group_id, user_id_list).await;
        }

        ExtractOutcome::Wait
    }

    /// Build the MemCell for a confirmed boundary at `index` (inclusive)
    async fn build_cell(
        &self,
        window: &[&RawMessage],
        index: usize,
        summary: Option<String>,
        group_id: Option<&str>,
        user_id_list: &[String],
    ) -> ExtractOutcome {
        let covered: Vec<RawMessage> = window[..=index].iter().map(|m| (*m).clone()).collect();

        let participants: Vec<String> = covered
            .iter()
            .map(|m| m.sender.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let timestamp = covered
            .last()
            .map(|m| m.create_time)
            .unwrap_or_else(chrono::Utc::now);

        // second oracle pass: long-form episode narrative over the covered run
        let episode_prompt = self.episode_prompt(&covered);
        let episode = match self.chat.generate(&episode_prompt).await {
            Ok(text) => {
                let trimmed = text.trim().to_string();
                if trimmed.is_empty() {
                    warn!("Episode narrative came back empty; holding window");
                    return ExtractOutcome::Wait;
                }
                trimmed
            }
            Err(e) => {
                warn!("Episode narrative generation failed: {e}; holding window");
                return ExtractOutcome::Wait;
            }
        };

        let user_id = user_id_list
            .first()
            .cloned()
            .or_else(|| participants.first().cloned())
            .unwrap_or_default();

        let mut cell = MemCell::new(
            user_id,
            group_id.map(str::to_string),
            participants,
            timestamp,
            episode,
        );
        cell.user_id_list = user_id_list.to_vec();
        cell.summary = summary;
        cell.original_data = covered;

        debug!(
            "Boundary confirmed: {} messages covered, event_id={}",
            cell.original_data.len(),
            cell.event_id
        );
        ExtractOutcome::Emit(cell)
    }

    fn boundary_prompt(&self, window: &[&RawMessage], smart_mask: bool) -> String {
        let transcript = render_transcript(window);
        let mask_note = if smart_mask {
            "The window is long: treat the oldest messages as background context \
             when judging the boundary, but still describe them in the summary.\n"
        } else {
            ""
        };
        format!(
            "You segment group conversations into episodes.\n\
             Decide whether the LAST message below marks the start of a new episode, \
             meaning the messages before it form a completed episode.\n{mask_note}\
             Messages (0-indexed):\n{transcript}\n\
             Answer with JSON only:\n\
             {{\"boundary\": true, \"boundary_index\": <index of the last message of the \
             completed episode>, \"summary\": \"<one sentence>\"}}\n\
             or {{\"boundary\": false}}\n\
             or {{\"wait\": true}} if you cannot judge yet."
        )
    }

    fn episode_prompt(&self, covered: &[RawMessage]) -> String {
        let refs: Vec<&RawMessage> = covered.iter().collect();
        let transcript = render_transcript(&refs);
        format!(
            "Write a third-person narrative of the following conversation episode. \
             Keep every concrete fact (names, dates, places, decisions). \
             Output plain text only.\n\n{transcript}"
        )
    }
}

/// Render a numbered transcript for the prompts
fn render_transcript(window: &[&RawMessage]) -> String {
    window
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let name = m.sender_name.as_deref().unwrap_or(&m.sender);
            format!(
                "{i}. [{}] {name}: {}",
                m.create_time.to_rfc3339_opts(SecondsFormat::Secs, true),
                m.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// TESTS
// ============================================================================
