//! Two- and three-way merge of append-only JSONL entity logs (Section 4.7).

use crate::jsonl::{sort_entities, JsonlEntity};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result of a resolve/merge pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveResult {
    pub entities: Vec<JsonlEntity>,
}

/// Two-way resolve (`resolveEntities`, Section 4.7.1).
///
/// Input is the flat concatenation of both sides of a git conflict region,
/// already stripped of conflict markers.
pub fn resolve_entities(input: Vec<JsonlEntity>) -> ResolveResult {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<JsonlEntity>> = HashMap::new();
    for e in input {
        groups.entry(e.uuid.clone()).or_insert_with(|| {
            order.push(e.uuid.clone());
            Vec::new()
        });
        groups.get_mut(&e.uuid).unwrap().push(e);
    }

    let mut resolved: Vec<JsonlEntity> = Vec::new();
    for uuid in &order {
        let versions = groups.remove(uuid).unwrap();
        if versions.len() == 1 {
            resolved.push(versions.into_iter().next().unwrap());
            continue;
        }

        let distinct_ids: HashSet<&str> = versions.iter().map(|v| v.id.as_str()).collect();
        if distinct_ids.len() == 1 {
            resolved.push(merge_metadata(&versions));
        } else {
            let mut sorted = versions;
            sorted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let newest = sorted.remove(0);
            let uuid_suffix: String = newest.uuid.chars().take(8).collect();
            for mut old in sorted {
                old.id = format!("{}-conflict-{}", old.id, uuid_suffix);
                resolved.push(old);
            }
            resolved.push(newest);
        }
    }

    rename_id_collisions(&mut resolved);
    sort_entities(&mut resolved);
    ResolveResult { entities: resolved }
}

/// Merge metadata across versions of the same entity: relationships/tags/
/// feedback are unioned; all other fields come from the most-recently-updated
/// version (Section 4.7.1 "Metadata merge rule").
fn merge_metadata(versions: &[JsonlEntity]) -> JsonlEntity {
    let mut by_age: Vec<&JsonlEntity> = versions.iter().collect();
    by_age.sort_by_key(|v| v.updated_at);
    let newest = *by_age.last().unwrap();

    let mut merged = newest.clone();

    let mut relationships = Vec::new();
    for v in versions {
        for r in &v.relationships {
            if !relationships.contains(r) {
                relationships.push(r.clone());
            }
        }
    }
    merged.relationships = relationships;

    let mut tags = Vec::new();
    for v in versions {
        for t in &v.tags {
            if !tags.contains(t) {
                tags.push(t.clone());
            }
        }
    }
    merged.tags = tags;

    let mut feedback = Vec::new();
    for v in &by_age {
        for f in &v.feedback {
            if let Some(pos) = feedback.iter().position(|e: &crate::jsonl::FeedbackEntry| e.id == f.id) {
                feedback[pos] = f.clone();
            } else {
                feedback.push(f.clone());
            }
        }
    }
    merged.feedback = feedback;

    merged.created_at = versions.iter().map(|v| v.created_at).min().unwrap();
    merged.updated_at = newest.updated_at;
    merged
}

/// Rename colliding ids (across different uuids) with `.1`, `.2`, ... suffixes
/// in arrival order; the first occurrence of an id keeps it unchanged.
fn rename_id_collisions(list: &mut [JsonlEntity]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for e in list.iter_mut() {
        let count = seen.entry(e.id.clone()).or_insert(0);
        if *count > 0 {
            e.id = format!("{}.{}", e.id, *count);
        }
        *count += 1;
    }
}

/// Three-way merge (`mergeThreeWay`, Section 4.7.2).
pub fn merge_three_way(
    base: Vec<JsonlEntity>,
    ours: Vec<JsonlEntity>,
    theirs: Vec<JsonlEntity>,
) -> ResolveResult {
    let base_map: HashMap<String, JsonlEntity> =
        base.into_iter().map(|e| (e.uuid.clone(), e)).collect();
    let mut ours_map: HashMap<String, JsonlEntity> =
        ours.into_iter().map(|e| (e.uuid.clone(), e)).collect();
    let mut theirs_map: HashMap<String, JsonlEntity> =
        theirs.into_iter().map(|e| (e.uuid.clone(), e)).collect();

    let mut uuids: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for uuid in base_map
        .keys()
        .chain(ours_map.keys())
        .chain(theirs_map.keys())
    {
        if seen.insert(uuid.clone()) {
            uuids.push(uuid.clone());
        }
    }

    let mut resolved: Vec<JsonlEntity> = Vec::new();
    for uuid in uuids {
        let b = base_map.get(&uuid);
        let o = ours_map.remove(&uuid);
        let t = theirs_map.remove(&uuid);
        match (b, o, t) {
            (Some(_), None, None) => {
                // deleted on both sides -> drop
            }
            (Some(_), Some(o), None) => resolved.push(o),
            (Some(_), None, Some(t)) => resolved.push(t),
            (None, Some(o), None) => resolved.push(o),
            (None, None, Some(t)) => resolved.push(t),
            (None, Some(o), Some(t)) => {
                // added on both sides, no base -> two-way resolve
                resolved.extend(resolve_entities(vec![o, t]).entities);
            }
            (Some(b), Some(o), Some(t)) => {
                let same_o = *b == o;
                let same_t = *b == t;
                if same_o && same_t {
                    resolved.push(b.clone());
                } else if same_o {
                    resolved.push(t);
                } else if same_t {
                    resolved.push(o);
                } else {
                    match merge_yaml(b, &o, &t) {
                        Ok(merged) => resolved.push(merged),
                        Err(_) => resolved.extend(resolve_entities(vec![o, t]).entities),
                    }
                }
            }
            (None, None, None) => unreachable!(),
        }
    }

    rename_id_collisions(&mut resolved);
    sort_entities(&mut resolved);
    ResolveResult { entities: resolved }
}

/// Modified-on-both-sides path: union metadata, then line-merge the canonical
/// YAML of the remaining fields; unresolved conflicts fall back to latest-wins.
fn merge_yaml(
    base: &JsonlEntity,
    ours: &JsonlEntity,
    theirs: &JsonlEntity,
) -> Result<JsonlEntity, MergeError> {
    let union = merge_metadata(&[base.clone(), ours.clone(), theirs.clone()]);

    let mut ours2 = ours.clone();
    ours2.relationships = union.relationships.clone();
    ours2.tags = union.tags.clone();
    ours2.feedback = union.feedback.clone();

    let mut theirs2 = theirs.clone();
    theirs2.relationships = union.relationships.clone();
    theirs2.tags = union.tags.clone();
    theirs2.feedback = union.feedback.clone();

    let base_yaml = serde_yaml::to_string(base)?;
    let ours_yaml = serde_yaml::to_string(&ours2)?;
    let theirs_yaml = serde_yaml::to_string(&theirs2)?;

    let base_lines: Vec<String> = base_yaml.lines().map(str::to_string).collect();
    let ours_lines: Vec<String> = ours_yaml.lines().map(str::to_string).collect();
    let theirs_lines: Vec<String> = theirs_yaml.lines().map(str::to_string).collect();

    let prefer_ours = ours.updated_at >= theirs.updated_at;
    let merged_lines = merge_lines(&base_lines, &ours_lines, &theirs_lines, prefer_ours);
    let merged_yaml = merged_lines.join("\n");

    let mut merged: JsonlEntity = serde_yaml::from_str(&merged_yaml)?;
    merged.updated_at = ours.updated_at.max(theirs.updated_at);
    Ok(merged)
}

#[derive(Debug, Clone, PartialEq)]
enum LineOp {
    Equal,
    Delete,
    Insert(String),
}

/// LCS-based line diff. Small-document oriented; entities are single YAML
/// documents, not arbitrary files.
fn diff_lines(base: &[String], other: &[String]) -> Vec<LineOp> {
    let (n, m) = (base.len(), other.len());
    let mut dp = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if base[i] == other[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if base[i] == other[j] {
            ops.push(LineOp::Equal);
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            ops.push(LineOp::Delete);
            i += 1;
        } else {
            ops.push(LineOp::Insert(other[j].clone()));
            j += 1;
        }
    }
    while i < n {
        ops.push(LineOp::Delete);
        i += 1;
    }
    while j < m {
        ops.push(LineOp::Insert(other[j].clone()));
        j += 1;
    }
    ops
}

#[derive(Debug, Clone, PartialEq)]
struct Hunk {
    base_start: usize,
    base_end: usize,
    replacement: Vec<String>,
}

fn to_hunks(ops: &[LineOp]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut base_idx = 0;
    let mut i = 0;
    while i < ops.len() {
        match &ops[i] {
            LineOp::Equal => {
                base_idx += 1;
                i += 1;
            }
            _ => {
                let start = base_idx;
                let mut replacement = Vec::new();
                while i < ops.len() && !matches!(ops[i], LineOp::Equal) {
                    match &ops[i] {
                        LineOp::Delete => base_idx += 1,
                        LineOp::Insert(line) => replacement.push(line.clone()),
                        LineOp::Equal => unreachable!(),
                    }
                    i += 1;
                }
                hunks.push(Hunk {
                    base_start: start,
                    base_end: base_idx,
                    replacement,
                });
            }
        }
    }
    hunks
}

/// Merge disjoint edit hunks from `ours` and `theirs` against `base`.
/// Overlapping hunks are resolved by `prefer_ours` ("latest wins").
fn merge_lines(
    base: &[String],
    ours: &[String],
    theirs: &[String],
    prefer_ours: bool,
) -> Vec<String> {
    let ours_hunks = to_hunks(&diff_lines(base, ours));
    let theirs_hunks = to_hunks(&diff_lines(base, theirs));

    let mut result = Vec::new();
    let mut idx = 0;
    let mut oi = 0;
    let mut ti = 0;

    while idx <= base.len() {
        let ours_here = ours_hunks.get(oi).filter(|h| h.base_start == idx).cloned();
        let theirs_here = theirs_hunks
            .get(ti)
            .filter(|h| h.base_start == idx)
            .cloned();

        match (ours_here, theirs_here) {
            (Some(oh), Some(th)) => {
                if oh.replacement == th.replacement && oh.base_end == th.base_end {
                    result.extend(oh.replacement.clone());
                } else if prefer_ours {
                    result.extend(oh.replacement.clone());
                } else {
                    result.extend(th.replacement.clone());
                }
                idx = oh.base_end.max(th.base_end);
                oi += 1;
                ti += 1;
            }
            (Some(oh), None) => {
                result.extend(oh.replacement.clone());
                idx = oh.base_end;
                oi += 1;
            }
            (None, Some(th)) => {
                result.extend(th.replacement.clone());
                idx = th.base_end;
                ti += 1;
            }
            (None, None) => {
                if idx < base.len() {
                    result.push(base[idx].clone());
                    idx += 1;
                } else {
                    break;
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::EntityKind;
    use chrono::{TimeZone, Utc};
    use serde_json::{Map, Value};

    fn entity(uuid: &str, id: &str, created: i64, updated: i64) -> JsonlEntity {
        JsonlEntity {
            entity_type: EntityKind::Issue,
            uuid: uuid.to_string(),
            id: id.to_string(),
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
            updated_at: Utc.timestamp_opt(updated, 0).unwrap(),
            relationships: vec![],
            tags: vec![],
            feedback: vec![],
            archived: false,
            extensions: Map::new(),
        }
    }

    fn with_content(mut e: JsonlEntity, content: &str) -> JsonlEntity {
        e.extensions
            .insert("content".to_string(), Value::String(content.to_string()));
        e
    }

    #[test]
    fn resolve_single_version_kept() {
        let r = resolve_entities(vec![entity("u1", "i-1", 1, 1)]);
        assert_eq!(r.entities.len(), 1);
    }

    #[test]
    fn resolve_same_uuid_same_id_keeps_newest_updated_at() {
        let a = entity("u1", "i-1", 1, 5);
        let b = entity("u1", "i-1", 1, 10);
        let r = resolve_entities(vec![a, b]);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.entities[0].updated_at.timestamp(), 10);
    }

    #[test]
    fn resolve_same_uuid_different_ids_renames_older() {
        let old = entity("uuid1234", "i-old", 1, 1);
        let new = entity("uuid1234", "i-new", 1, 5);
        let r = resolve_entities(vec![old, new]);
        assert_eq!(r.entities.len(), 2);
        let renamed = r.entities.iter().find(|e| e.id.starts_with("i-old")).unwrap();
        assert_eq!(renamed.id, "i-old-conflict-uuid1234");
        let kept = r.entities.iter().find(|e| e.id == "i-new").unwrap();
        assert_eq!(kept.updated_at.timestamp(), 5);
    }

    #[test]
    fn resolve_id_collision_across_uuids_gets_suffix() {
        let e1 = entity("u1", "dup", 1, 1);
        let e2 = entity("u2", "dup", 2, 2);
        let r = resolve_entities(vec![e1, e2]);
        let ids: Vec<&str> = r.entities.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains(&"dup"));
        assert!(ids.contains(&"dup.1"));
    }

    #[test]
    fn resolve_round_trip_one_record_per_uuid() {
        let list = vec![
            entity("u1", "i-1", 1, 1),
            entity("u1", "i-1", 1, 2),
            entity("u2", "i-2", 3, 3),
        ];
        let r = resolve_entities(list);
        let uuids: HashSet<&str> = r.entities.iter().map(|e| e.uuid.as_str()).collect();
        assert_eq!(uuids.len(), 2);
    }

    #[test]
    fn resolve_is_sorted_by_created_then_id() {
        let list = vec![entity("u2", "i-2", 5, 5), entity("u1", "i-1", 1, 1)];
        let r = resolve_entities(list);
        assert_eq!(r.entities[0].id, "i-1");
        assert_eq!(r.entities[1].id, "i-2");
    }

    #[test]
    fn merge_metadata_unions_tags_and_relationships() {
        let mut a = entity("u1", "i-1", 1, 1);
        a.tags = vec!["alpha".into()];
        let mut b = entity("u1", "i-1", 1, 5);
        b.tags = vec!["beta".into()];
        let merged = merge_metadata(&[a, b]);
        assert_eq!(merged.tags.len(), 2);
        assert!(merged.tags.contains(&"alpha".to_string()));
        assert!(merged.tags.contains(&"beta".to_string()));
    }

    #[test]
    fn three_way_modified_on_both_merges_distinct_lines() {
        let base = with_content(entity("u1", "i-1", 0, 0), "a\nb\nc");
        let ours = with_content(entity("u1", "i-1", 0, 1), "a\nb2\nc");
        let theirs = with_content(entity("u1", "i-1", 0, 2), "a\nb\nc2");

        let r = merge_three_way(vec![base], vec![ours], vec![theirs]);
        assert_eq!(r.entities.len(), 1);
        let merged = &r.entities[0];
        assert_eq!(merged.id, "i-1");
        assert_eq!(merged.updated_at.timestamp(), 2);
        let content = merged.extensions.get("content").unwrap().as_str().unwrap();
        assert!(content.contains("b2"));
        assert!(content.contains("c2"));
    }

    #[test]
    fn three_way_deleted_on_both_drops() {
        let base = entity("u1", "i-1", 0, 0);
        let r = merge_three_way(vec![base], vec![], vec![]);
        assert_eq!(r.entities.len(), 0);
    }

    #[test]
    fn three_way_deleted_one_modified_other_wins() {
        let base = entity("u1", "i-1", 0, 0);
        let ours = entity("u1", "i-1", 0, 5);
        let r = merge_three_way(vec![base], vec![ours], vec![]);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.entities[0].updated_at.timestamp(), 5);
    }

    #[test]
    fn three_way_added_one_side_only_is_taken() {
        let ours = entity("u1", "i-1", 1, 1);
        let r = merge_three_way(vec![], vec![ours], vec![]);
        assert_eq!(r.entities.len(), 1);
    }

    #[test]
    fn three_way_unchanged_on_both_keeps_base() {
        let base = entity("u1", "i-1", 0, 0);
        let ours = base.clone();
        let theirs = base.clone();
        let r = merge_three_way(vec![base], vec![ours], vec![theirs]);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.entities[0].updated_at.timestamp(), 0);
    }

    #[test]
    fn merge_three_way_is_deterministic() {
        let base = with_content(entity("u1", "i-1", 0, 0), "a\nb\nc");
        let ours = with_content(entity("u1", "i-1", 0, 1), "a\nb2\nc");
        let theirs = with_content(entity("u1", "i-1", 0, 2), "a\nb\nc2");

        let r1 = merge_three_way(vec![base.clone()], vec![ours.clone()], vec![theirs.clone()]);
        let r2 = merge_three_way(vec![base], vec![ours], vec![theirs]);
        assert_eq!(r1, r2);
    }
}
