//! Bounded per-session dialogue history

use std::collections::VecDeque;

use super::{ChatMessage, Role};

/// Dialogue kept for one session
#[derive(Debug, Clone)]
pub struct DialogueHistory {
    system_prompt: Option<String>,
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
}

impl DialogueHistory {
    /// Create an empty history keeping at most `max_messages` messages
    #[must_use]
    pub fn new(system_prompt: Option<String>, max_messages: usize) -> Self {
        Self {
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
            messages: VecDeque::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Append a message, trimming the oldest turns
    ///
    /// History never starts with an assistant or tool message, so trimming
    /// drops whole exchanges rather than leaving orphaned replies.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);

        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
        while self
            .messages
            .front()
            .is_some_and(|m| matches!(m.role, Role::Assistant | Role::Tool))
        {
            self.messages.pop_front();
        }
    }

    /// Record a completed exchange
    ///
    /// Turns are only committed once answered, so an interrupted or failed
    /// turn leaves no user message behind.
    pub fn commit_turn(&mut self, user: ChatMessage, reply: ChatMessage) {
        self.push(user);
        self.push(reply);
    }

    /// Messages for the next request, system prompt first
    #[must_use]
    pub fn request_messages(&self) -> Vec<ChatMessage> {
        self.system_prompt
            .iter()
            .map(ChatMessage::system)
            .chain(self.messages.iter().cloned())
            .collect()
    }

    /// Request messages for a turn that has not been committed yet
    #[must_use]
    pub fn request_with(&self, pending: &ChatMessage) -> Vec<ChatMessage> {
        let mut messages = self.request_messages();
        messages.push(pending.clone());
        messages
    }

    /// Stored messages, oldest first
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_leads_requests() {
        let mut history = DialogueHistory::new(Some("be brief".into()), 10);
        history.push(ChatMessage::user("hi"));
        let messages = history.request_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn blank_system_prompt_is_ignored() {
        let mut history = DialogueHistory::new(Some("  ".into()), 10);
        history.push(ChatMessage::user("hi"));
        assert_eq!(history.request_messages().len(), 1);
    }

    #[test]
    fn trimming_never_leaves_orphaned_replies() {
        let mut history = DialogueHistory::new(None, 3);
        history.push(ChatMessage::user("one"));
        history.push(ChatMessage::assistant("1", Vec::new()));
        history.push(ChatMessage::user("two"));
        history.push(ChatMessage::assistant("2", Vec::new()));

        let roles: Vec<Role> = history.messages().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(history.messages().next().unwrap().content, "two");
    }

    #[test]
    fn pending_turn_is_not_stored() {
        let mut history = DialogueHistory::new(None, 10);
        history.commit_turn(ChatMessage::user("one"), ChatMessage::assistant("1", Vec::new()));

        let request = history.request_with(&ChatMessage::user("two"));
        assert_eq!(request.len(), 3);
        assert_eq!(request[2].content, "two");
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages().last().unwrap().content, "1");
    }
}
