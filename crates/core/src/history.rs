use shinku_llm::Message;

/// Chronological record of completed exchanges.
///
/// Only whole messages are stored: user prompts as soon as a turn starts,
/// assistant replies once their stream has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Copy of the current sequence, unaffected by later mutation.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
