//! JSONL entity record model for `issues.jsonl` / `specs.jsonl` (Section 3, Section 6.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tagged union discriminant for a JSONL entity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    Spec,
}

/// A relationship to another entity, e.g. "blocks", "child_of".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub to_id: String,
    pub to_type: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Relationship {
    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.to_id, &self.to_type, &self.kind)
    }
}

/// A single piece of feedback attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub id: String,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// One persisted line in `issues.jsonl` / `specs.jsonl`.
///
/// `extensions` preserves type-specific and unknown fields opaquely, per the
/// "dynamic typing ... replaced by a tagged union with a free-form extensions
/// map" design note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonlEntity {
    pub entity_type: EntityKind,
    /// Globally unique, stable across renames.
    pub uuid: String,
    /// Human-readable hash id; may collide across uuids.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<FeedbackEntry>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub archived: bool,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl JsonlEntity {
    /// Canonicalize vector fields into the export sort order (Section 6.2):
    /// relationships by `(to_id, to_type, type)`; tags lexicographically;
    /// feedback by id.
    pub fn canonicalize(&mut self) {
        self.relationships
            .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.tags.sort();
        self.feedback.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

/// Sort a list of top-level entities by `created_at` then `id` (Section 6.2).
pub fn sort_entities(entities: &mut [JsonlEntity]) {
    entities.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Serialize one entity per line, each canonicalized and newline-terminated.
pub fn export_jsonl(entities: &[JsonlEntity]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for entity in entities {
        let mut e = entity.clone();
        e.canonicalize();
        out.push_str(&serde_json::to_string(&e)?);
        out.push('\n');
    }
    Ok(out)
}
