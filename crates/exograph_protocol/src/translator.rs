//! Client id / server id translation.

use std::collections::HashMap;

type Table = HashMap<String, HashMap<String, String>>;

/// Bidirectional id-mapping table keyed by category (type name).
///
/// The forward table maps client ids to server ids; the reverse table maps
/// server ids back to client ids. Lookups never fail, they return `None`.
#[derive(Debug, Clone, Default)]
pub struct Translator {
    forward: Table,
    reverse: Table,
}

impl Translator {
    /// Creates an empty translator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the value registered for a client key.
    pub fn forward(&self, category: &str, key: &str) -> Option<&str> {
        lookup(&self.forward, category, key)
    }

    /// Looks up the client key registered for a server value.
    pub fn reverse(&self, category: &str, key: &str) -> Option<&str> {
        lookup(&self.reverse, category, key)
    }

    /// Registers `key -> value` and, unless suppressed, `value -> key`.
    ///
    /// Re-adding an existing key overwrites it.
    pub fn add(&mut self, category: &str, key: &str, value: &str, suppress_reverse: bool) {
        self.forward
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        if !suppress_reverse {
            self.reverse
                .entry(category.to_string())
                .or_default()
                .insert(value.to_string(), key.to_string());
        }
    }

    /// Resolves an incoming id to the id the client most likely knows it by.
    ///
    /// The id is first mapped forward (or kept), then reversed (or kept).
    pub fn translate_id(&self, category: &str, id: &str) -> String {
        let server_id = self.forward(category, id).unwrap_or(id);
        self.reverse(category, server_id)
            .unwrap_or(server_id)
            .to_string()
    }

    /// Returns the ids under which an incoming id may be registered locally,
    /// most likely first, without duplicates.
    pub fn candidates(&self, category: &str, id: &str) -> Vec<String> {
        let translated = self.translate_id(category, id);
        let mut out: Vec<String> = Vec::with_capacity(4);
        let mut push = |candidate: Option<&str>| {
            if let Some(c) = candidate {
                if !out.iter().any(|o| o == c) {
                    out.push(c.to_string());
                }
            }
        };
        push(Some(translated.as_str()));
        push(Some(id));
        push(self.forward(category, &translated));
        push(self.forward(category, id));
        out
    }

    /// Returns the number of forward entries.
    pub fn len(&self) -> usize {
        self.forward.values().map(HashMap::len).sum()
    }

    /// Returns true if no mapping has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lookup<'a>(table: &'a Table, category: &str, key: &str) -> Option<&'a str> {
    table
        .get(category)
        .and_then(|m| m.get(key))
        .map(String::as_str)
}
