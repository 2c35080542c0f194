//! Ordered message list of one conversation.

use mercato_messaging::{ConversationId, DeliveryStatus, LocalEchoId, Message};

/// Result of offering a pushed message to the active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// An entry with the same server id is already present.
    Duplicate,
    /// Sent by the local participant; the send pipeline owns those entries.
    OwnMessage,
    OtherConversation,
    NoActiveConversation,
}

/// Result of swapping an optimistic entry for its confirmed copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The optimistic entry now carries the confirmed state.
    Updated,
    /// The confirmed copy was already present; the optimistic entry was dropped.
    Conflict,
    /// No entry with that echo token.
    Missing,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: Message,
}

/// Messages ordered by `created_at`, ties broken by insertion order.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn find_local(&self, echo: LocalEchoId) -> Option<&Message> {
        self.position_of_echo(echo)
            .map(|index| &self.entries[index].message)
    }

    /// Replaces the list with an authoritative fetch.
    ///
    /// Unconfirmed local entries survive unless the fetch already holds their
    /// confirmed copy. Duplicate ids in the fetch collapse to the first.
    pub fn replace(&mut self, fetched: Vec<Message>) {
        let survivors: Vec<Message> = self
            .entries
            .drain(..)
            .map(|entry| entry.message)
            .filter(|local| {
                !local.is_confirmed()
                    && !fetched.iter().any(|remote| remote.same_logical(local))
            })
            .collect();

        for message in fetched {
            let duplicate = message.id.is_some()
                && self
                    .entries
                    .iter()
                    .any(|entry| entry.message.id == message.id);
            if !duplicate {
                self.push(message);
            }
        }
        for local in survivors {
            self.push(local);
        }
        self.sort();
    }

    pub fn push_local(&mut self, message: Message) {
        self.push(message);
        self.sort();
    }

    pub fn merge_remote(&mut self, message: Message) -> MergeOutcome {
        if let Some(id) = &message.id {
            if self
                .entries
                .iter()
                .any(|entry| entry.message.id.as_ref() == Some(id))
            {
                return MergeOutcome::Duplicate;
            }
        }
        self.push(message);
        self.sort();
        MergeOutcome::Appended
    }

    /// Updates the optimistic entry for `echo` in place with the confirmed
    /// copy, keeping its insertion rank.
    pub fn reconcile(&mut self, echo: LocalEchoId, mut confirmed: Message) -> ReconcileOutcome {
        let Some(index) = self.position_of_echo(echo) else {
            return ReconcileOutcome::Missing;
        };

        let collides = confirmed.id.is_some()
            && self.entries.iter().enumerate().any(|(other, entry)| {
                other != index && entry.message.id == confirmed.id
            });
        if collides {
            self.entries.remove(index);
            return ReconcileOutcome::Conflict;
        }

        confirmed.status = DeliveryStatus::Confirmed;
        confirmed.local_echo_id.get_or_insert(echo);
        self.entries[index].message = confirmed;
        self.sort();
        ReconcileOutcome::Updated
    }

    pub fn set_status(&mut self, echo: LocalEchoId, status: DeliveryStatus) -> bool {
        match self.position_of_echo(echo) {
            Some(index) if !self.entries[index].message.is_confirmed() => {
                self.entries[index].message.status = status;
                true
            }
            _ => false,
        }
    }

    /// Removes an unconfirmed entry.
    pub fn remove_local(&mut self, echo: LocalEchoId) -> Option<Message> {
        let index = self.position_of_echo(echo)?;
        if self.entries[index].message.is_confirmed() {
            return None;
        }
        Some(self.entries.remove(index).message)
    }

    /// Stamps the durable id onto entries created while the conversation was
    /// a pending intent.
    pub fn assign_conversation(&mut self, id: &ConversationId) {
        for entry in &mut self.entries {
            entry.message.conversation_id.get_or_insert_with(|| id.clone());
        }
    }

    fn push(&mut self, message: Message) {
        self.next_seq += 1;
        self.entries.push(Entry {
            seq: self.next_seq,
            message,
        });
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.seq.cmp(&b.seq))
        });
    }

    fn position_of_echo(&self, echo: LocalEchoId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message.local_echo_id == Some(echo))
    }
}
