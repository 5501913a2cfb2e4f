//! Entity stage backends.

use tracing::debug;

use crate::config::{EntitiesConfig, EntityBackend};
use crate::error::{ServiceError, ServiceResult, format_error_chain_ref};
use crate::ollama::OllamaClient;

use super::types::PAGE_SEPARATOR;

/// Capitalised words that do not begin an entity on their own
const FUNCTION_WORDS: &[&str] = &[
    "A", "After", "Also", "An", "And", "As", "At", "Before", "But", "By", "For", "From", "He",
    "Her", "Here", "His", "However", "I", "If", "In", "It", "Its", "Of", "On", "Or", "She", "So",
    "That", "The", "Their", "Then", "There", "These", "They", "This", "Those", "To", "Today",
    "Tomorrow", "We", "When", "While", "With", "Yesterday", "You",
];

/// Turns chunk text into an ordered list of entities
pub enum EntityExtractor {
    /// Runs of capitalised words
    Heuristic,
    /// Delegates to an Ollama model
    Ollama(OllamaClient),
}

impl EntityExtractor {
    pub fn from_config(config: &EntitiesConfig) -> ServiceResult<Self> {
        match config.backend {
            EntityBackend::Heuristic => Ok(EntityExtractor::Heuristic),
            EntityBackend::Ollama => Ok(EntityExtractor::Ollama(OllamaClient::new(config)?)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            EntityExtractor::Heuristic => "heuristic",
            EntityExtractor::Ollama(_) => "ollama",
        }
    }

    /// Extract entities in order of appearance. Blank text yields no entities.
    pub async fn extract(&self, text: &str) -> ServiceResult<Vec<String>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        check_well_formed(text)?;

        match self {
            EntityExtractor::Heuristic => Ok(capitalised_runs(text)),
            EntityExtractor::Ollama(client) => {
                client.extract_entities(text).await.map_err(|e| match e {
                    ServiceError::EntityExtraction { .. } => e,
                    other => ServiceError::EntityExtraction {
                        message: format_error_chain_ref(&other),
                    },
                })
            }
        }
    }
}

/// Text with control characters other than whitespace is malformed
fn check_well_formed(text: &str) -> ServiceResult<()> {
    if let Some((offset, c)) = text
        .char_indices()
        .find(|(_, c)| c.is_control() && !c.is_whitespace())
    {
        return Err(ServiceError::EntityExtraction {
            message: format!(
                "malformed input: control character U+{:04X} at byte {}",
                c as u32, offset
            ),
        });
    }
    Ok(())
}

fn is_capitalised(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

/// Collect runs of consecutive capitalised words.
///
/// A run ends at a lowercase word, at clause punctuation or at a blank line;
/// a capitalised function word never starts a run.
fn capitalised_runs(text: &str) -> Vec<String> {
    let entities: Vec<String> = text.split(PAGE_SEPARATOR).flat_map(paragraph_runs).collect();
    debug!(entities = entities.len(), "Heuristic entity pass finished");
    entities
}

fn paragraph_runs(paragraph: &str) -> Vec<String> {
    let mut entities = Vec::new();
    let mut run: Vec<&str> = Vec::new();

    for raw in paragraph.split_whitespace() {
        let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
        let ends_clause = raw
            .chars()
            .last()
            .is_some_and(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')' | ']'));

        let starts_or_extends = is_capitalised(word)
            && !(run.is_empty() && FUNCTION_WORDS.contains(&word));

        if starts_or_extends {
            run.push(word);
        } else if !run.is_empty() {
            entities.push(run.join(" "));
            run.clear();
        }

        if ends_clause && !run.is_empty() {
            entities.push(run.join(" "));
            run.clear();
        }
    }

    if !run.is_empty() {
        entities.push(run.join(" "));
    }
    entities
}
