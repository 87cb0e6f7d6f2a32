// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory enumeration sessions
//!
//! The OS opens a directory by handing the channel an opaque session id and
//! later drains entries through it, possibly across several buffer-limited
//! calls, possibly restarting from scratch. Each session keeps the cached
//! listing, a cursor, and the saved wildcard expression.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::dispatcher::EnumEntry;
use crate::os::Guid;

/// One open directory listing.
#[derive(Debug)]
pub struct Enumerator {
    entries: Vec<EnumEntry>,
    index: usize,
    search_expression: Option<String>,
}

impl Enumerator {
    pub fn new(entries: Vec<EnumEntry>) -> Enumerator {
        Enumerator {
            entries,
            index: 0,
            search_expression: None,
        }
    }

    pub fn is_search_expression_empty(&self) -> bool {
        self.search_expression.is_none()
    }

    pub fn save_expression(&mut self, expression: &str) {
        self.search_expression = Some(expression.to_string());
    }

    pub fn search_expression(&self) -> Option<&str> {
        self.search_expression.as_deref()
    }

    /// Reset the cursor to the beginning of the listing.
    pub fn restart(&mut self) {
        self.index = 0;
    }

    /// Entries not yet delivered to the OS.
    pub fn pending_entries(&self) -> &[EnumEntry] {
        &self.entries[self.index..]
    }

    /// Move the cursor past one delivered entry.
    pub fn advance(&mut self) {
        self.index += 1;
    }
}

/// Concurrent map of open enumeration sessions keyed by the OS-supplied
/// session id. A missing entry on lookup is a client error, not a panic.
#[derive(Default)]
pub struct EnumerationRegistry {
    sessions: DashMap<Guid, Arc<Mutex<Enumerator>>>,
}

impl EnumerationRegistry {
    pub fn new() -> EnumerationRegistry {
        EnumerationRegistry::default()
    }

    pub fn insert(&self, session_id: Guid, enumerator: Enumerator) {
        self.sessions.insert(session_id, Arc::new(Mutex::new(enumerator)));
    }

    pub fn find(&self, session_id: &Guid) -> Option<Arc<Mutex<Enumerator>>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Drop a session. Unknown ids are fine; the OS may retry the close.
    pub fn remove(&self, session_id: &Guid) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
