//! Turn history
//!
//! Ordered, append-only record of the turns in a conversation.

use crate::types::{Role, Turn};

/// Ordered record of conversation turns.
///
/// Turns are only ever appended. The one exception is
/// [`TurnHistory::clear_conversation`], used when a session does not keep
/// history between responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnHistory {
    turns: Vec<Turn>,
}

impl TurnHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn to the end of the history
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Removes and returns the most recent turn
    pub fn pop(&mut self) -> Option<Turn> {
        self.turns.pop()
    }

    pub fn as_slice(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Roles of all turns, in order
    pub fn roles(&self) -> Vec<Role> {
        self.turns.iter().map(Turn::role).collect()
    }

    /// Removes every user and assistant turn, keeping system turns in place.
    ///
    /// Returns the number of turns removed.
    pub fn clear_conversation(&mut self) -> usize {
        let before = self.turns.len();
        self.turns.retain(|turn| turn.role() == Role::System);
        before - self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let mut history = TurnHistory::new();
        history.push(Turn::user("a"));
        history.push(Turn::assistant("b"));
        history.push(Turn::user("c"));

        assert_eq!(history.len(), 3);
        assert_eq!(
            history.roles(),
            vec![Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(history.as_slice()[2].content(), "c");
    }

    #[test]
    fn test_clear_conversation_keeps_system_turns() {
        let mut history = TurnHistory::new();
        history.push(Turn::system("Be brief."));
        history.push(Turn::user("Hi"));
        history.push(Turn::assistant("Hello"));

        assert_eq!(history.clear_conversation(), 2);
        assert_eq!(history.as_slice(), &[Turn::system("Be brief.")]);
    }
}
