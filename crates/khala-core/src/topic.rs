//! Topic parsing and wildcard matching
//!
//! Topics come in two shapes:
//! ```text
//! pylon/1.marsara/wifi/poll        prefix / device / path…
//! $khala/devices/connect           internal prefix / path…
//! ```
//!
//! Wildcards (subscription filters only):
//! - `+` matches exactly one segment
//! - `#` matches any number of trailing segments, terminal position only
//!
//! Topics whose first segment equals the process-wide internal prefix never
//! cross the network and never match non-internal filters.

use std::fmt;
use std::sync::OnceLock;

use crate::events::SubscribeEvent;

/// Prefix of device-originated telemetry topics
pub const DEVICE_PREFIX: &str = "pylon";

/// Prefix of control-facing derived topics
pub const CONTROL_PREFIX: &str = "matriarch";

/// Internal prefix used when none is configured
pub const DEFAULT_INTERNAL_PREFIX: &str = "$khala";

static INTERNAL_PREFIX: OnceLock<String> = OnceLock::new();

/// Set the prefix that marks in-process-only topics. May be called at most
/// once, before any listener starts; later calls are ignored.
pub fn set_internal_prefix(prefix: impl Into<String>) {
    let _ = INTERNAL_PREFIX.set(prefix.into());
}

/// The active internal topic prefix.
pub fn internal_prefix() -> &'static str {
    INTERNAL_PREFIX
        .get()
        .map(String::as_str)
        .unwrap_or(DEFAULT_INTERNAL_PREFIX)
}

/// A parsed topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Topic {
    pub prefix: String,
    pub device_name: String,
    pub path: String,
}

impl Topic {
    /// Device telemetry topic: `pylon/<device>/<path>`
    pub fn device(device_name: &str, path: &str) -> Self {
        Self {
            prefix: DEVICE_PREFIX.to_string(),
            device_name: device_name.to_string(),
            path: path.to_string(),
        }
    }

    /// Control-facing topic: `matriarch/<device>/<path>`
    pub fn control(device_name: &str, path: &str) -> Self {
        Self {
            prefix: CONTROL_PREFIX.to_string(),
            device_name: device_name.to_string(),
            path: path.to_string(),
        }
    }

    /// In-process-only topic: `<internal prefix>/<path>`
    pub fn internal(path: &str) -> Self {
        Self {
            prefix: internal_prefix().to_string(),
            device_name: String::new(),
            path: path.to_string(),
        }
    }

    /// Decompose a raw topic name. A single leading `/` is stripped.
    /// Internal-prefixed names carry no device segment; everything after the
    /// prefix is the path.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.strip_prefix('/').unwrap_or(raw);

        if let Some(path) = raw
            .strip_prefix(internal_prefix())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            return Self {
                prefix: internal_prefix().to_string(),
                device_name: String::new(),
                path: path.to_string(),
            };
        }
        if raw == internal_prefix() {
            return Self {
                prefix: raw.to_string(),
                device_name: String::new(),
                path: String::new(),
            };
        }

        let mut parts = raw.splitn(3, '/');
        Self {
            prefix: parts.next().unwrap_or_default().to_string(),
            device_name: parts.next().unwrap_or_default().to_string(),
            path: parts.next().unwrap_or_default().to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.prefix == internal_prefix()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)?;
        if !self.device_name.is_empty() {
            write!(f, "/{}", self.device_name)?;
        }
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

/// Whether a raw topic name is in-process-only.
pub fn is_internal(topic: &str) -> bool {
    let topic = topic.strip_prefix('/').unwrap_or(topic);
    topic
        .split('/')
        .next()
        .is_some_and(|first| first == internal_prefix())
}

/// MQTT filter matching: segment-wise, `+` matches one segment, a terminal
/// `#` matches the remainder (including zero segments). A filter on one side
/// of the internal boundary never matches a topic on the other.
pub fn topics_match(pattern: &str, topic: &str) -> bool {
    if is_internal(pattern) != is_internal(topic) {
        return false;
    }

    let pattern: Vec<&str> = pattern.split('/').collect();
    let topic: Vec<&str> = topic.split('/').collect();
    segments_match(&pattern, &topic)
}

fn segments_match(pattern: &[&str], topic: &[&str]) -> bool {
    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            "#" => return i == pattern.len() - 1,
            "+" => {
                if i >= topic.len() {
                    return false;
                }
            }
            seg => {
                if i >= topic.len() || seg != topic[i] {
                    return false;
                }
            }
        }
        i += 1;
    }
    i == topic.len()
}

/// Validate a subscription filter: non-empty, `#` only in terminal position,
/// `+` and `#` only as whole segments.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let segments: Vec<&str> = filter.split('/').collect();
    for (i, seg) in segments.iter().enumerate() {
        if *seg == "#" && i != segments.len() - 1 {
            return false;
        }
        if seg.len() > 1 && (seg.contains('#') || seg.contains('+')) {
            return false;
        }
    }
    true
}

/// Filter the topics of a [`SubscribeEvent`] down to those a snapshot
/// handler can answer: non-internal, `matriarch`-prefixed, with a concrete
/// device name, and whose path satisfies `matches`. Order is preserved.
/// A bare `#` path is the "replay everything" form and is passed to the
/// predicate like any other path.
pub fn filter_subscribe_topics(
    event: &SubscribeEvent,
    matches: impl Fn(&str) -> bool,
) -> Vec<Topic> {
    event
        .topics
        .iter()
        .map(|raw| Topic::parse(raw))
        .filter(|t| t.prefix == CONTROL_PREFIX && t.device_name != "+" && matches(&t.path))
        .collect()
}
