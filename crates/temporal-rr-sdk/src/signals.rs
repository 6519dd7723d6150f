// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run signal buffering.

use std::collections::{BTreeMap, VecDeque};

/// Maps a name to either a registered handler or the invocations that
/// arrived before one was registered. Buffered invocations are released in
/// arrival order when the handler attaches.
pub struct SignalQueue<H, A> {
    handlers: BTreeMap<String, H>,
    buffered: BTreeMap<String, VecDeque<A>>,
}

impl<H, A> Default for SignalQueue<H, A> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            buffered: BTreeMap::new(),
        }
    }
}

impl<H: Clone, A> SignalQueue<H, A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an invocation. Returns the handler to run it with, or `None`
    /// if it was buffered.
    pub fn push(&mut self, name: &str, args: A) -> Option<(H, A)> {
        match self.handlers.get(name) {
            Some(handler) => Some((handler.clone(), args)),
            None => {
                self.buffered
                    .entry(name.to_string())
                    .or_default()
                    .push_back(args);
                None
            }
        }
    }

    /// Register `handler` and return the buffered invocations, oldest first.
    pub fn attach(&mut self, name: &str, handler: H) -> Vec<A> {
        self.handlers.insert(name.to_string(), handler);
        self.buffered
            .remove(name)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn buffered_len(&self, name: &str) -> usize {
        self.buffered.get(name).map_or(0, VecDeque::len)
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
        self.buffered.clear();
    }
}
