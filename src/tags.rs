//! Tag key policy and aggregated tag-blob serialization.
//!
//! The key sets live on the open session (one [`KeyPolicy`] per source),
//! never in process globals, so independent sources keep independent
//! policies. Blob output comes in two wire styles fixed per source:
//! PostgreSQL HSTORE (`"key"=>"value"`) and a JSON object.

use std::collections::HashSet;

use log::debug;

/// Serialized form of the aggregated tag blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagBlobStyle {
    /// `"key"=>"value"` pairs, comma separated.
    #[default]
    Hstore,
    /// A JSON object with string values.
    Json,
}

/// Session-scoped tag key sets.
///
/// Ignored keys (and ignored `"prefix:"` namespaces) never enter blob
/// fields. Insignificant keys do not count when deciding whether an
/// entity carries real information. Keys dropped from a blob are
/// debug-logged the first time they are seen.
#[derive(Debug, Default)]
pub struct KeyPolicy {
    ignored: HashSet<String>,
    insignificant: HashSet<String>,
    warned: HashSet<String>,
}

impl KeyPolicy {
    /// Empty policy: every key is significant and blob-eligible.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock policy of the OSM driver configuration: bookkeeping
    /// keys are dropped from blobs and do not make an entity relevant.
    pub fn default_osm() -> Self {
        let mut policy = Self::new();
        for key in [
            "created_by",
            "converted_by",
            "source",
            "time",
            "ele",
            "attribution",
            "fixme",
            "FIXME",
            "openGeoDB:",
        ] {
            policy.add_ignored_key(key);
        }
        for key in ["created_by", "converted_by", "source", "time", "ele"] {
            policy.add_insignificant_key(key);
        }
        policy
    }

    /// Drop `key` from blob serialization. A key ending in `:` acts as a
    /// namespace prefix and drops every key underneath it.
    pub fn add_ignored_key(&mut self, key: &str) {
        self.ignored.insert(key.to_owned());
    }

    /// Exclude `key` from significance tests.
    pub fn add_insignificant_key(&mut self, key: &str) {
        self.insignificant.insert(key.to_owned());
    }

    /// True when `key` counts towards "this entity is interesting".
    pub fn is_significant(&self, key: &str) -> bool {
        !self.insignificant.contains(key)
    }

    /// True when any tag in `tags` has a significant key.
    pub fn has_significant_tag<'a, T>(&self, tags: T) -> bool
    where
        T: IntoIterator<Item = (&'a str, &'a str)>,
    {
        tags.into_iter().any(|(key, _)| self.is_significant(key))
    }

    /// True when `key` may be serialized into a blob field: neither the
    /// key itself nor its `"prefix:"` namespace is ignored.
    pub fn include_in_blob(&self, key: &str) -> bool {
        if self.ignored.contains(key) {
            return false;
        }
        match key.find(':') {
            Some(colon) => key
                .get(..=colon)
                .is_none_or(|prefix| !self.ignored.contains(prefix)),
            None => true,
        }
    }

    /// Record that `key` was dropped from a blob; logs once per key.
    pub(crate) fn note_dropped(&mut self, key: &str) {
        if self.warned.insert(key.to_owned()) {
            debug!("ignored tag key: {key}");
        }
    }
}

/// Incremental builder for the single per-record tag blob.
#[derive(Debug)]
pub(crate) struct BlobBuilder {
    style: TagBlobStyle,
    buffer: String,
}

impl BlobBuilder {
    pub(crate) fn new(style: TagBlobStyle) -> Self {
        Self {
            style,
            buffer: String::new(),
        }
    }

    pub(crate) fn push(&mut self, key: &str, value: &str) {
        match self.style {
            TagBlobStyle::Hstore => {
                if !self.buffer.is_empty() {
                    self.buffer.push(',');
                }
                escape_hstore(key, &mut self.buffer);
                self.buffer.push_str("=>");
                escape_hstore(value, &mut self.buffer);
            }
            TagBlobStyle::Json => {
                if self.buffer.is_empty() {
                    self.buffer.push('{');
                } else {
                    self.buffer.push(',');
                }
                escape_json(key, &mut self.buffer);
                self.buffer.push(':');
                escape_json(value, &mut self.buffer);
            }
        }
    }

    /// Final serialized blob, or `None` when nothing was pushed.
    pub(crate) fn finish(mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.style == TagBlobStyle::Json {
            self.buffer.push('}');
        }
        Some(self.buffer)
    }
}

/// Append `value` as a double-quoted HSTORE string: `"` and `\` are
/// backslash-escaped.
pub fn escape_hstore(value: &str, out: &mut String) {
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}

/// Append `value` as a JSON string literal; control characters below
/// U+0020 become `\uXXXX` escapes.
pub fn escape_json(value: &str, out: &mut String) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ if u32::from(ch) < 0x20 => {
                out.push_str(&format!("\\u{:04X}", u32::from(ch)));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}
