//! Keyed record collections with upsert-by-id
//!
//! `Collection` keeps records in first-seen order: upserting a known key
//! replaces the record where it sits, an unknown key is appended. Nothing
//! is ever removed by an upsert.

use crate::types::{Message, Session};
use std::collections::HashMap;
use std::hash::Hash;

/// A record with a stable identity
pub trait Record: Clone {
    type Key: Clone + Eq + Hash;

    fn key(&self) -> Self::Key;
}

impl Record for Session {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Record for Message {
    /// `(sessionID, id)`: message ids are only unique within a session
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.session_id.clone(), self.id.clone())
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(usize),
    Replaced(usize),
}

impl Upsert {
    pub fn index(self) -> usize {
        match self {
            Upsert::Inserted(i) | Upsert::Replaced(i) => i,
        }
    }
}

/// Ordered, keyed collection
#[derive(Debug, Clone)]
pub struct Collection<T: Record> {
    records: Vec<T>,

    /// key → index into `records`
    index: HashMap<T::Key, usize>,
}

impl<T: Record> Default for Collection<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Record> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by key, preserving first-seen position
    pub fn upsert(&mut self, record: T) -> Upsert {
        let key = record.key();
        match self.index.get(&key) {
            Some(&i) => {
                self.records[i] = record;
                Upsert::Replaced(i)
            }
            None => {
                let i = self.records.len();
                self.records.push(record);
                self.index.insert(key, i);
                Upsert::Inserted(i)
            }
        }
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.index.get(key).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, key: &T::Key) -> Option<&mut T> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records matching `pred`, keeping the relative order of the rest
    fn retain(&mut self, mut pred: impl FnMut(&T) -> bool) {
        self.records.retain(|r| pred(r));
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key(), i))
            .collect();
    }
}

/// Session summaries keyed by id
pub type SessionStore = Collection<Session>;

/// Messages across every session seen in this process
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Collection<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, message: Message) -> Upsert {
        self.messages.upsert(message)
    }

    pub fn get(&self, session_id: &str, message_id: &str) -> Option<&Message> {
        self.messages
            .get(&(session_id.to_string(), message_id.to_string()))
    }

    pub fn get_mut(&mut self, session_id: &str, message_id: &str) -> Option<&mut Message> {
        self.messages
            .get_mut(&(session_id.to_string(), message_id.to_string()))
    }

    /// Messages of one session in first-seen order
    pub fn for_session<'a>(&'a self, session_id: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages.iter().filter(move |m| m.session_id == session_id)
    }

    /// Replace one session's messages with a freshly fetched history
    ///
    /// Other sessions are left as they are. The history's order becomes
    /// the first-seen order for this session.
    pub fn replace_session(&mut self, session_id: &str, history: Vec<Message>) {
        self.messages.retain(|m| m.session_id != session_id);
        for message in history {
            if message.session_id != session_id {
                tracing::warn!(
                    expected = %session_id,
                    actual = %message.session_id,
                    message = %message.id,
                    "History contained a message for another session; skipping"
                );
                continue;
            }
            self.messages.upsert(message);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
