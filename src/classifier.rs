//! Telemetry classification: raw Moonraker frames → semantic events.
//!
//! Classification is a pure function of the message text and the rule table.
//! The table is built once from the configured trigger texts and never
//! mutated, so classifying the same message twice always yields the same
//! events.

use crate::error::MalformedMessage;

/// JSON-RPC method Moonraker uses to forward G-code console output.
pub const GCODE_RESPONSE_METHOD: &str = "notify_gcode_response";

/// Prefix Klipper puts in front of `RESPOND`/`M118` console lines.
pub const ECHO_PREFIX: &str = "echo: ";

pub const DEFAULT_START_TRIGGER: &str = "Toolchange Starting";
pub const DEFAULT_COMPLETE_TRIGGER: &str = "Toolchange Completed";

// ---------------------------------------------------------------------------
// EventKind / Event
// ---------------------------------------------------------------------------

/// The closed set of events the bridge reacts to.
///
/// The snake_case form is the key used in the `[scenes]` and `[triggers]`
/// config tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ToolChangeStarted,
    ToolChangeCompleted,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::ToolChangeStarted, EventKind::ToolChangeCompleted];

    /// Config-table key for this kind.
    pub fn key(&self) -> &'static str {
        match self {
            EventKind::ToolChangeStarted => "tool_change_started",
            EventKind::ToolChangeCompleted => "tool_change_completed",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.key() == key)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// One classified occurrence. Produced and consumed within a single
/// message-handling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Event { kind }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Ordered `(prefix, kind)` rule table. First matching prefix wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    rules: Vec<(String, EventKind)>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_triggers(DEFAULT_START_TRIGGER, DEFAULT_COMPLETE_TRIGGER)
    }
}

impl Classifier {
    /// Build the rule table from the two trigger texts.
    ///
    /// Each trigger matches both as written and behind [`ECHO_PREFIX`]; a
    /// trigger that already carries the echo prefix yields a single rule.
    pub fn from_triggers(start: &str, complete: &str) -> Self {
        let mut rules = Vec::with_capacity(4);
        for (trigger, kind) in [
            (start, EventKind::ToolChangeStarted),
            (complete, EventKind::ToolChangeCompleted),
        ] {
            rules.push((trigger.to_string(), kind));
            if !trigger.starts_with(ECHO_PREFIX) {
                rules.push((format!("{ECHO_PREFIX}{trigger}"), kind));
            }
        }
        Self { rules }
    }

    /// Use an explicit rule table, in priority order.
    pub fn with_rules(rules: Vec<(String, EventKind)>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[(String, EventKind)] {
        &self.rules
    }

    /// Classify a single console line.
    pub fn classify_line(&self, line: &str) -> Option<EventKind> {
        self.rules
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, kind)| *kind)
    }

    /// Classify one raw telemetry frame.
    ///
    /// # Returns
    /// - `Ok(events)` in the order their lines appear in `params`; empty for
    ///   any method other than [`GCODE_RESPONSE_METHOD`], for a missing or
    ///   non-array `params`, and for non-object JSON.
    /// - `Err(MalformedMessage)` when `raw` is not JSON at all.
    pub fn classify(&self, raw: &str) -> Result<Vec<Event>, MalformedMessage> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| MalformedMessage { detail: e.to_string() })?;

        if value.get("method").and_then(|m| m.as_str()) != Some(GCODE_RESPONSE_METHOD) {
            return Ok(Vec::new());
        }

        let Some(params) = value.get("params").and_then(|p| p.as_array()) else {
            return Ok(Vec::new());
        };

        Ok(params
            .iter()
            .filter_map(|line| line.as_str())
            .filter_map(|line| self.classify_line(line))
            .map(Event::from)
            .collect())
    }
}
