//! Budgeted prompt assembly.
//!
//! A prompt is the persona's system instructions, the retrieved chunks
//! (numbered and tagged with their source document), the recent
//! conversation turns and the question. When the estimate exceeds the
//! budget, the lowest-relevance chunks go first (the best chunk is kept),
//! then the oldest turns. The question is never cut; if even the question
//! with the best chunk does not fit, assembly fails with
//! [`GenerationServiceError::ContextTooLong`].

use crate::error::GenerationServiceError;
use crate::generate::Prompt;
use crate::models::{Role, RetrievedChunk, SourceRef, Turn};

pub const DEFAULT_FALLBACK: &str = "I could not find information on this topic in the available company documents. Please consult your manager or the relevant department.";

/// Who the assistant is and how it must answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: String,
    /// Replaces the built-in instructions when set.
    pub system_prompt: Option<String>,
    pub core_values: Option<String>,
    /// Returned verbatim when nothing relevant is retrieved.
    pub fallback_message: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "DocQA".to_string(),
            system_prompt: None,
            core_values: None,
            fallback_message: DEFAULT_FALLBACK.to_string(),
        }
    }
}

impl Persona {
    pub fn system_message(&self) -> String {
        let mut out = match &self.system_prompt {
            Some(custom) => custom.trim().to_string(),
            None => format!(
                "You are {name}, an assistant that answers questions using only the \
                 provided documents.\n\
                 1. Answer directly, using only information from the numbered context passages.\n\
                 2. If the context does not contain the answer, reply exactly: \"{fallback}\"\n\
                 3. Do not invent information or use outside knowledge.\n\
                 4. Cite the passages you used by their [n] markers and name the source documents.",
                name = self.name,
                fallback = self.fallback_message,
            ),
        };
        if let Some(values) = self.core_values.as_deref().map(str::trim) {
            if !values.is_empty() {
                out.push_str("\n\nFollow these core values in tone and content:\n");
                out.push_str(values);
            }
        }
        out
    }
}

/// Token budget for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptBudget {
    /// Generator context window.
    pub context_tokens: usize,
    /// Reserved for the answer.
    pub max_answer_tokens: usize,
}

impl PromptBudget {
    pub fn available(&self) -> usize {
        self.context_tokens.saturating_sub(self.max_answer_tokens)
    }
}

/// Result of [`assemble`].
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub prompt: Prompt,
    /// Chunks that made it into the prompt, best first.
    pub included: Vec<RetrievedChunk>,
    pub turns_included: usize,
    pub chunks_dropped: usize,
    pub turns_dropped: usize,
}

impl AssembledPrompt {
    /// Distinct document ids of the included chunks, in prompt order.
    pub fn citations(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.included {
            if !out.contains(&c.metadata.document_id) {
                out.push(c.metadata.document_id.clone());
            }
        }
        out
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        self.included
            .iter()
            .map(|c| SourceRef {
                document_id: c.metadata.document_id.clone(),
                chunk_id: c.chunk_id.clone(),
                position: c.metadata.position,
                section: c.metadata.section.clone(),
                score: c.score,
            })
            .collect()
    }
}

fn render_user(chunks: &[RetrievedChunk], turns: &[Turn], question: &str) -> String {
    let mut out = String::new();
    if !chunks.is_empty() {
        out.push_str("Context:\n");
        for (i, c) in chunks.iter().enumerate() {
            out.push_str(&format!("[{}] Source: {}", i + 1, c.metadata.document_id));
            if let Some(section) = &c.metadata.section {
                out.push_str(&format!(" ({section})"));
            }
            out.push('\n');
            out.push_str(c.metadata.text.trim());
            out.push_str("\n\n");
        }
    }
    if !turns.is_empty() {
        out.push_str("Conversation so far:\n");
        for t in turns {
            let who = match t.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(&format!("{who}: {}\n", t.text.trim()));
        }
        out.push('\n');
    }
    out.push_str("Question: ");
    out.push_str(question);
    out
}

/// Assemble a prompt that fits `budget`.
///
/// `chunks` must be ordered best first; `turns` oldest first.
pub fn assemble(
    system: &str,
    chunks: &[RetrievedChunk],
    turns: &[Turn],
    question: &str,
    budget: PromptBudget,
) -> Result<AssembledPrompt, GenerationServiceError> {
    let limit = budget.available();
    let mut n_chunks = chunks.len();
    let mut first_turn = 0;

    let build = |n_chunks: usize, first_turn: usize| Prompt {
        system: system.to_string(),
        user: render_user(&chunks[..n_chunks], &turns[first_turn..], question),
    };

    let mut prompt = build(n_chunks, first_turn);
    while prompt.token_estimate() > limit && n_chunks > 1 {
        n_chunks -= 1;
        prompt = build(n_chunks, first_turn);
    }
    while prompt.token_estimate() > limit && first_turn < turns.len() {
        first_turn += 1;
        prompt = build(n_chunks, first_turn);
    }
    if prompt.token_estimate() > limit {
        return Err(GenerationServiceError::ContextTooLong(format!(
            "prompt needs ~{} tokens, budget is {}",
            prompt.token_estimate(),
            limit
        )));
    }

    Ok(AssembledPrompt {
        prompt,
        included: chunks[..n_chunks].to_vec(),
        turns_included: turns.len() - first_turn,
        chunks_dropped: chunks.len() - n_chunks,
        turns_dropped: first_turn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordMetadata, SourceFormat};
    use chrono::Utc;

    fn hit(doc: &str, pos: usize, score: f32, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: format!("{doc}-{pos}"),
            score,
            metadata: RecordMetadata {
                document_id: doc.to_string(),
                source_format: SourceFormat::Text,
                position: pos,
                text: text.to_string(),
                section: Some(format!("page {}", pos + 1)),
                content_hash: String::new(),
                tags: Default::default(),
            },
        }
    }

    fn turn(role: Role, text: &str) -> Turn {
        Turn {
            conversation_id: "c".into(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    const ROOMY: PromptBudget = PromptBudget {
        context_tokens: 10_000,
        max_answer_tokens: 500,
    };

    #[test]
    fn test_everything_fits() {
        let chunks = vec![
            hit("a", 0, 0.9, "The sky is blue."),
            hit("b", 0, 0.5, "Water is wet."),
            hit("a", 1, 0.4, "Fire is hot."),
        ];
        let turns = vec![turn(Role::User, "hi"), turn(Role::Assistant, "hello")];
        let out = assemble("sys", &chunks, &turns, "What color?", ROOMY).unwrap();
        assert_eq!(out.included.len(), 3);
        assert_eq!(out.turns_included, 2);
        assert_eq!(out.citations(), vec!["a", "b"]);
        assert!(out.prompt.user.contains("[1] Source: a (page 1)\nThe sky is blue."));
        assert!(out.prompt.user.contains("User: hi\nAssistant: hello"));
        assert!(out.prompt.user.ends_with("Question: What color?"));
    }

    #[test]
    fn test_drops_lowest_relevance_first() {
        let long = "word ".repeat(100);
        let chunks = vec![
            hit("best", 0, 0.9, &long),
            hit("mid", 0, 0.6, &long),
            hit("low", 0, 0.3, &long),
        ];
        let turns = vec![turn(Role::User, "earlier question")];
        let budget = PromptBudget {
            context_tokens: 340,
            max_answer_tokens: 50,
        };
        let out = assemble("sys", &chunks, &turns, "q?", budget).unwrap();
        let docs: Vec<_> = out.included.iter().map(|c| c.metadata.document_id.as_str()).collect();
        assert_eq!(docs, vec!["best", "mid"]);
        assert_eq!(out.chunks_dropped, 1);
        assert_eq!(out.turns_included, 1);
        assert!(out.prompt.token_estimate() <= budget.available());
    }

    #[test]
    fn test_drops_oldest_turns_after_chunks() {
        let chunks = vec![hit("a", 0, 0.9, &"x".repeat(400)), hit("b", 0, 0.8, "y")];
        let turns = vec![
            turn(Role::User, &"old ".repeat(50)),
            turn(Role::Assistant, "recent answer"),
        ];
        let budget = PromptBudget {
            context_tokens: 150,
            max_answer_tokens: 10,
        };
        let out = assemble("sys", &chunks, &turns, "q?", budget).unwrap();
        assert_eq!(out.included.len(), 1);
        assert_eq!(out.turns_dropped, 1);
        assert!(out.prompt.user.contains("Assistant: recent answer"));
        assert!(!out.prompt.user.contains("old old"));
    }

    #[test]
    fn test_question_is_never_truncated() {
        let question = "why ".repeat(200);
        let chunks = vec![hit("a", 0, 0.9, "short")];
        let budget = PromptBudget {
            context_tokens: 100,
            max_answer_tokens: 10,
        };
        let err = assemble("sys", &chunks, &[], &question, budget).unwrap_err();
        assert!(matches!(err, GenerationServiceError::ContextTooLong(_)));
    }

    #[test]
    fn test_persona_system_message() {
        let persona = Persona {
            name: "Metamorphic GPT".into(),
            core_values: Some("Integrity first.".into()),
            ..Persona::default()
        };
        let msg = persona.system_message();
        assert!(msg.starts_with("You are Metamorphic GPT"));
        assert!(msg.contains(DEFAULT_FALLBACK));
        assert!(msg.ends_with("Integrity first."));

        let custom = Persona {
            system_prompt: Some("Be brief.".into()),
            ..Persona::default()
        };
        assert_eq!(custom.system_message(), "Be brief.");
    }
}
