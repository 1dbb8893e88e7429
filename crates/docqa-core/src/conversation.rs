//! Per-conversation short-term memory.
//!
//! Each conversation is an append-only turn log bounded by a turn count
//! and a token budget. Appending past either bound drops the oldest
//! turns first. Nothing is ever summarized implicitly: callers that want
//! a summary compute it and hand it to
//! [`ConversationStore::replace_with_summary`].
//!
//! The number of live conversations is bounded too; the least recently
//! active conversation is forgotten when a new one would exceed it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;

use crate::chunk::estimate_tokens;
use crate::models::{Role, Turn};

/// Retention bounds for [`ConversationStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_turns: usize,
    pub max_tokens: usize,
    pub max_conversations: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_tokens: 4000,
            max_conversations: 1000,
        }
    }
}

/// How much history [`ConversationStore::recent_turns`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnLimit {
    /// The newest `n` turns.
    Turns(usize),
    /// As many of the newest turns as fit in this many tokens.
    Tokens(usize),
}

#[derive(Default)]
struct Log {
    turns: VecDeque<Turn>,
    tokens: usize,
    last_active: u64,
}

impl Log {
    fn push(&mut self, turn: Turn) {
        self.tokens += estimate_tokens(&turn.text);
        self.turns.push_back(turn);
    }

    fn pop_oldest(&mut self) {
        if let Some(t) = self.turns.pop_front() {
            self.tokens -= estimate_tokens(&t.text);
        }
    }
}

#[derive(Default)]
struct State {
    logs: HashMap<String, Log>,
    clock: u64,
}

/// Thread-safe store of conversation logs.
pub struct ConversationStore {
    policy: RetentionPolicy,
    state: Mutex<State>,
}

impl ConversationStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Append a turn and enforce the retention bounds.
    ///
    /// The turn just appended is always kept, even when it alone exceeds
    /// the token budget.
    pub fn append_turn(&self, conversation_id: &str, role: Role, text: &str) -> Turn {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.push_turn(&mut state, conversation_id, role, text)
    }

    /// Append a question and its answer as adjacent turns.
    ///
    /// Both are written under one lock, so concurrent exchanges on the same
    /// conversation never interleave.
    pub fn append_exchange(
        &self,
        conversation_id: &str,
        question: &str,
        answer: &str,
    ) -> (Turn, Turn) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let user = self.push_turn(&mut state, conversation_id, Role::User, question);
        let assistant = self.push_turn(&mut state, conversation_id, Role::Assistant, answer);
        (user, assistant)
    }

    fn push_turn(
        &self,
        state: &mut State,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> Turn {
        let turn = Turn {
            conversation_id: conversation_id.to_string(),
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        };

        state.clock += 1;
        let now = state.clock;

        if !state.logs.contains_key(conversation_id)
            && state.logs.len() >= self.policy.max_conversations.max(1)
        {
            let stale = state
                .logs
                .iter()
                .min_by_key(|(_, log)| log.last_active)
                .map(|(id, _)| id.clone());
            if let Some(stale) = stale {
                state.logs.remove(&stale);
            }
        }

        let log = state.logs.entry(conversation_id.to_string()).or_default();
        log.last_active = now;
        log.push(turn.clone());
        while log.turns.len() > 1
            && (log.turns.len() > self.policy.max_turns || log.tokens > self.policy.max_tokens)
        {
            log.pop_oldest();
        }
        turn
    }

    /// Recent turns of a conversation, oldest first.
    pub fn recent_turns(&self, conversation_id: &str, limit: TurnLimit) -> Vec<Turn> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(log) = state.logs.get(conversation_id) else {
            return Vec::new();
        };
        let take = match limit {
            TurnLimit::Turns(n) => n.min(log.turns.len()),
            TurnLimit::Tokens(budget) => {
                let mut used = 0;
                log.turns
                    .iter()
                    .rev()
                    .take_while(|t| {
                        used += estimate_tokens(&t.text);
                        used <= budget
                    })
                    .count()
            }
        };
        log.turns
            .iter()
            .skip(log.turns.len() - take)
            .cloned()
            .collect()
    }

    /// Forget a conversation. Returns whether it existed.
    pub fn clear(&self, conversation_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.logs.remove(conversation_id).is_some()
    }

    /// Replace a conversation's history with a single assistant turn
    /// holding `summary`. Returns false if the conversation is unknown.
    pub fn replace_with_summary(&self, conversation_id: &str, summary: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(log) = state.logs.get_mut(conversation_id) else {
            return false;
        };
        log.turns.clear();
        log.tokens = 0;
        log.push(Turn {
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            text: summary.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    pub fn turn_count(&self, conversation_id: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.logs.get(conversation_id).map_or(0, |l| l.turns.len())
    }

    pub fn conversation_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .logs
            .len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}
