//! Name-based routing of inbound envelopes to listener channels.
//!
//! The router is owned by the stream worker and is never shared; callers
//! reach it only through `StreamConnection` commands.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::stream::proto::InboundEnvelope;

#[derive(Debug, Default)]
pub(crate) struct Router {
    interests: HashSet<String>,
    listeners: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks `name` active. Returns `true` when the name was not yet known.
    ///
    /// Known names are looked up without allocating.
    pub(crate) fn record_interest(&mut self, name: &str) -> bool {
        !self.interests.contains(name) && self.interests.insert(name.to_string())
    }

    /// Registers `listener` for `name`, dropping listeners of that name whose
    /// subscription was already released.
    pub(crate) fn add_listener(&mut self, name: &str, listener: mpsc::UnboundedSender<Value>) {
        self.record_interest(name);
        let listeners = self.listeners.entry(name.to_string()).or_default();
        listeners.retain(|existing| !existing.is_closed());
        listeners.push(listener);
    }

    /// Drops every listener channel so that each open sequence terminates.
    ///
    /// The interest set is kept.
    pub(crate) fn end_listeners(&mut self) -> usize {
        let ended = self.listeners.values().map(Vec::len).sum();
        self.listeners.clear();
        ended
    }

    /// Pushes the envelope payload to every listener registered for its
    /// routing key. Returns the number of listeners that received it.
    pub(crate) fn dispatch(&mut self, envelope: InboundEnvelope) -> usize {
        let Some(method) = envelope.method.as_deref() else {
            return 0;
        };
        if !self.interests.contains(method) {
            return 0;
        }
        let Some(listeners) = self.listeners.get_mut(method) else {
            return 0;
        };

        let params = envelope.params;
        listeners.retain(|listener| listener.send(params.clone()).is_ok());
        let delivered = listeners.len();
        if listeners.is_empty() {
            self.listeners.remove(method);
        }
        delivered
    }

    pub(crate) fn interests(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interests.iter().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }
}
