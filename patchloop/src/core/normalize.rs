//! Shape normalization for model output, applied before schema validation.
//!
//! Each pass is total: it never fails and leaves values it does not
//! recognize untouched, so a pass can only make a document more conformant.
//! Passes run in a fixed order; later passes rely on earlier ones (for
//! example, id synthesis expects `tasks` to already be an array).

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::invariants::MIN_TASK_ID_LEN;
use crate::core::schema::Contract;

const PLAN_KEYS: &[&str] = &[
    "summary",
    "tasks",
    "files_to_touch",
    "test_strategy",
    "risks",
    "assumptions",
    "extra",
];
const TASK_KEYS: &[&str] = &["id", "title", "description"];
const PATCH_KEYS: &[&str] = &["files", "patches", "notes"];
const FILE_KEYS: &[&str] = &["operation", "content"];
const DIFF_KEYS: &[&str] = &["path", "diff"];
const REPORT_KEYS: &[&str] = &[
    "passed",
    "summary",
    "failure_hints",
    "acceptance_criteria_status",
    "recommended_patch",
    "extra",
];
const CRITERION_KEYS: &[&str] = &["criterion", "met", "evidence"];

const EVIDENCE_LIMIT: usize = 400;

/// Run-level facts some passes need.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeContext<'a> {
    pub acceptance_criteria: &'a [String],
}

type Pass = fn(&mut Value, Contract, &NormalizeContext<'_>) -> bool;

/// Ordered passes with the deviation each one fixes.
const PASSES: &[(&str, Pass)] = &[
    // `{"plan": {...}}` and similar one-level envelopes.
    ("unwrap_envelope", unwrap_envelope),
    // Historical report fields (`tests_passed`, `test_summary`).
    ("legacy_aliases", legacy_aliases),
    // `files` as a list, bare string contents, `patches` as a single string.
    ("legacy_patch_shapes", legacy_patch_shapes),
    // Numbers/booleans where strings are expected, "true" where a bool is.
    ("coerce_scalars", coerce_scalars),
    // Tasks without ids, or with ids shorter than the minimum.
    ("synthesize_task_ids", synthesize_task_ids),
    // Reports that omit some of the requested acceptance criteria.
    ("fill_missing_criteria", fill_missing_criteria),
    // Fields the contract does not know about.
    ("fold_unknown_fields", fold_unknown_fields),
];

/// Apply every pass in order.
pub fn normalize(mut value: Value, contract: Contract, ctx: &NormalizeContext<'_>) -> Value {
    for (name, pass) in PASSES {
        if pass(&mut value, contract, ctx) {
            debug!(pass = name, contract = %contract, "normalization applied");
        }
    }
    value
}

fn unwrap_envelope(value: &mut Value, contract: Contract, _ctx: &NormalizeContext<'_>) -> bool {
    let Some(obj) = value.as_object_mut() else {
        return false;
    };
    let known = known_keys(contract);
    if obj
        .keys()
        .any(|k| known.contains(&k.as_str()) && !matches!(k.as_str(), "notes" | "extra"))
    {
        return false;
    }
    let Some(key) = contract
        .envelope_keys()
        .iter()
        .copied()
        .find(|k| obj.get(*k).is_some_and(Value::is_object))
    else {
        return false;
    };
    match obj.remove(key) {
        Some(inner) => {
            *value = inner;
            true
        }
        None => false,
    }
}

fn legacy_aliases(value: &mut Value, contract: Contract, _ctx: &NormalizeContext<'_>) -> bool {
    if contract != Contract::TestReport {
        return false;
    }
    let Some(obj) = value.as_object_mut() else {
        return false;
    };
    let mut changed = rename(obj, &["tests_passed"], "passed");
    changed |= rename(obj, &["test_summary"], "summary");
    changed
}

fn rename(obj: &mut Map<String, Value>, aliases: &[&str], canonical: &str) -> bool {
    if obj.contains_key(canonical) {
        return false;
    }
    for alias in aliases {
        if let Some(v) = obj.remove(*alias) {
            obj.insert(canonical.to_string(), v);
            return true;
        }
    }
    false
}

fn legacy_patch_shapes(value: &mut Value, contract: Contract, _ctx: &NormalizeContext<'_>) -> bool {
    match contract {
        Contract::Patch => value.as_object_mut().is_some_and(reshape_patch),
        Contract::TestReport => {
            let Some(obj) = value.as_object_mut() else {
                return false;
            };
            match obj.get_mut("recommended_patch") {
                Some(Value::Null) => {
                    obj.remove("recommended_patch");
                    true
                }
                Some(Value::Object(patch)) => reshape_patch(patch),
                _ => false,
            }
        }
        Contract::Plan | Contract::Repair => false,
    }
}

fn reshape_patch(obj: &mut Map<String, Value>) -> bool {
    let mut changed = false;

    if let Some(Value::Array(items)) = obj.get("files") {
        let mut map = Map::new();
        for item in items {
            let Some(entry) = item.as_object() else {
                continue;
            };
            let Some(path) = ["path", "file"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(Value::as_str))
            else {
                continue;
            };
            let mut change = Map::new();
            for (k, v) in entry {
                if !matches!(k.as_str(), "path" | "file") {
                    change.insert(k.clone(), v.clone());
                }
            }
            map.insert(path.to_string(), Value::Object(change));
        }
        obj.insert("files".to_string(), Value::Object(map));
        changed = true;
    }

    if let Some(Value::Object(files)) = obj.get_mut("files") {
        for change in files.values_mut() {
            let replacement = match change {
                Value::String(content) => {
                    Some(serde_json::json!({"operation": "modify", "content": content}))
                }
                Value::Null => Some(serde_json::json!({"operation": "delete"})),
                Value::Object(entry) => {
                    let operation = entry.get("operation").and_then(Value::as_str);
                    match operation {
                        Some(op) => {
                            if let Some(canonical) = canonical_operation(op)
                                && canonical != op
                            {
                                entry.insert("operation".to_string(), Value::from(canonical));
                                changed = true;
                            }
                        }
                        None if entry.contains_key("content") => {
                            entry.insert("operation".to_string(), Value::from("modify"));
                            changed = true;
                        }
                        None => {}
                    }
                    None
                }
                _ => None,
            };
            if let Some(replacement) = replacement {
                *change = replacement;
                changed = true;
            }
        }
    }

    match obj.get_mut("patches") {
        Some(Value::String(diff)) => {
            let diff = std::mem::take(diff);
            obj.insert(
                "patches".to_string(),
                serde_json::json!([{"path": "", "diff": diff}]),
            );
            changed = true;
        }
        Some(single @ Value::Object(_)) => {
            *single = Value::Array(vec![single.take()]);
            changed = true;
        }
        _ => {}
    }
    if let Some(Value::Array(items)) = obj.get_mut("patches") {
        for item in items.iter_mut() {
            if let Some(diff) = item.as_str() {
                *item = serde_json::json!({"path": "", "diff": diff});
                changed = true;
            } else if let Some(entry) = item.as_object_mut() {
                changed |= rename(entry, &["file"], "path");
            }
        }
    }

    if let Some(Value::String(note)) = obj.get("notes") {
        let note = note.clone();
        obj.insert("notes".to_string(), Value::Array(vec![Value::from(note)]));
        changed = true;
    }
    changed
}

fn canonical_operation(op: &str) -> Option<&'static str> {
    match op.trim().to_ascii_lowercase().as_str() {
        "add" | "create" => Some("add"),
        "modify" | "update" => Some("modify"),
        "delete" | "remove" => Some("delete"),
        _ => None,
    }
}

fn coerce_scalars(value: &mut Value, contract: Contract, _ctx: &NormalizeContext<'_>) -> bool {
    let Some(obj) = value.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    match contract {
        Contract::Plan => {
            changed |= coerce_string_fields(obj, &["summary", "test_strategy", "extra"]);
            changed |= coerce_string_lists(obj, &["files_to_touch", "risks", "assumptions"]);
            if let Some(Value::Array(tasks)) = obj.get_mut("tasks") {
                for task in tasks.iter_mut().filter_map(Value::as_object_mut) {
                    changed |= coerce_string_fields(task, TASK_KEYS);
                }
            }
        }
        Contract::Patch => {
            changed |= coerce_patch_scalars(obj);
        }
        Contract::TestReport => {
            changed |= coerce_string_fields(obj, &["summary", "extra"]);
            changed |= coerce_string_lists(obj, &["failure_hints"]);
            changed |= coerce_bool_field(obj, "passed");
            if let Some(Value::Array(items)) = obj.get_mut("acceptance_criteria_status") {
                for item in items.iter_mut().filter_map(Value::as_object_mut) {
                    changed |= coerce_string_fields(item, &["criterion", "evidence"]);
                    changed |= coerce_bool_field(item, "met");
                }
            }
            if let Some(Value::Object(patch)) = obj.get_mut("recommended_patch") {
                changed |= coerce_patch_scalars(patch);
            }
        }
        Contract::Repair => {}
    }
    changed
}

fn coerce_patch_scalars(obj: &mut Map<String, Value>) -> bool {
    let mut changed = coerce_string_lists(obj, &["notes"]);
    if let Some(Value::Object(files)) = obj.get_mut("files") {
        for entry in files.values_mut().filter_map(Value::as_object_mut) {
            changed |= coerce_string_fields(entry, &["content"]);
        }
    }
    if let Some(Value::Array(items)) = obj.get_mut("patches") {
        for entry in items.iter_mut().filter_map(Value::as_object_mut) {
            changed |= coerce_string_fields(entry, DIFF_KEYS);
        }
    }
    changed
}

fn coerce_string_fields(obj: &mut Map<String, Value>, keys: &[&str]) -> bool {
    let mut changed = false;
    for key in keys {
        let Some(v) = obj.get_mut(*key) else {
            continue;
        };
        let replacement = match v {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        if let Some(s) = replacement {
            *v = Value::String(s);
            changed = true;
        }
    }
    changed
}

fn coerce_string_lists(obj: &mut Map<String, Value>, keys: &[&str]) -> bool {
    let mut changed = false;
    for key in keys {
        let Some(v) = obj.get_mut(*key) else {
            continue;
        };
        let replacement = match v {
            Value::Null => Some(Vec::new()),
            Value::String(s) => Some(vec![Value::String(s.clone())]),
            Value::Array(items) => {
                for item in items.iter_mut().filter(|i| !i.is_string()) {
                    *item = Value::String(value_to_text(item));
                    changed = true;
                }
                None
            }
            _ => None,
        };
        if let Some(items) = replacement {
            *v = Value::Array(items);
            changed = true;
        }
    }
    changed
}

fn coerce_bool_field(obj: &mut Map<String, Value>, key: &str) -> bool {
    let Some(v) = obj.get_mut(key) else {
        return false;
    };
    let parsed = match v {
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "passed" | "pass" | "met" => Some(true),
            "false" | "no" | "failed" | "fail" | "not met" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    };
    if let Some(b) = parsed {
        *v = Value::Bool(b);
        return true;
    }
    false
}

fn synthesize_task_ids(value: &mut Value, contract: Contract, _ctx: &NormalizeContext<'_>) -> bool {
    if contract != Contract::Plan {
        return false;
    }
    let Some(Value::Array(tasks)) = value.get_mut("tasks") else {
        return false;
    };
    let mut changed = false;
    let mut seen: Vec<String> = tasks
        .iter()
        .filter_map(|t| t.get("id").and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| s.chars().count() >= MIN_TASK_ID_LEN)
        .collect();
    for task in tasks.iter_mut().filter_map(Value::as_object_mut) {
        let current = task
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if current.chars().count() >= MIN_TASK_ID_LEN {
            continue;
        }
        let mut id = if current.is_empty() {
            let title = task.get("title").and_then(Value::as_str).unwrap_or_default();
            let description = task
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            stable_task_id(title, description)
        } else {
            format!("T-{current}")
        };
        let base = id.clone();
        let mut n = 2;
        while seen.contains(&id) {
            id = format!("{base}-{n}");
            n += 1;
        }
        seen.push(id.clone());
        task.insert("id".to_string(), Value::String(id));
        changed = true;
    }
    changed
}

/// Content-derived id so repeated runs of the same plan agree.
pub fn stable_task_id(title: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(description.trim().as_bytes());
    let hex = hex::encode(hasher.finalize());
    format!("T-{}", &hex[..8])
}

fn fill_missing_criteria(value: &mut Value, contract: Contract, ctx: &NormalizeContext<'_>) -> bool {
    if contract != Contract::TestReport {
        return false;
    }
    let Some(obj) = value.as_object_mut() else {
        return false;
    };

    if !obj.contains_key("acceptance_criteria_status") {
        // Legacy report without per-criterion status: every criterion
        // inherits the overall verdict.
        let passed = obj.get("passed").and_then(Value::as_bool).unwrap_or(false);
        let evidence = obj
            .get("criteria_verification")
            .or_else(|| obj.get("summary"))
            .map(value_to_text)
            .unwrap_or_default();
        let evidence = truncate_chars(&evidence, EVIDENCE_LIMIT);
        let statuses: Vec<Value> = ctx
            .acceptance_criteria
            .iter()
            .map(|c| serde_json::json!({"criterion": c, "met": passed, "evidence": evidence}))
            .collect();
        obj.insert(
            "acceptance_criteria_status".to_string(),
            Value::Array(statuses),
        );
        return true;
    }

    let Some(Value::Array(statuses)) = obj.get_mut("acceptance_criteria_status") else {
        return false;
    };
    let mut changed = false;
    for criterion in ctx.acceptance_criteria {
        let wanted = criterion.trim().to_lowercase();
        let present = statuses.iter().any(|s| {
            s.get("criterion")
                .and_then(Value::as_str)
                .is_some_and(|c| c.trim().to_lowercase() == wanted)
        });
        if !present {
            statuses.push(serde_json::json!({
                "criterion": criterion,
                "met": false,
                "evidence": "not reported",
            }));
            changed = true;
        }
    }
    changed
}

fn fold_unknown_fields(value: &mut Value, contract: Contract, _ctx: &NormalizeContext<'_>) -> bool {
    let Some(obj) = value.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    match contract {
        Contract::Plan => {
            if let Some(Value::Array(tasks)) = obj.get_mut("tasks") {
                for task in tasks.iter_mut().filter_map(Value::as_object_mut) {
                    let folded = take_unknown(task, TASK_KEYS);
                    if !folded.is_empty() {
                        append_text(task, "description", &folded.join("\n"));
                        changed = true;
                    }
                }
            }
            let folded = take_unknown(obj, PLAN_KEYS);
            if !folded.is_empty() {
                append_text(obj, "extra", &folded.join("\n"));
                changed = true;
            }
        }
        Contract::Patch => {
            changed |= fold_patch_unknown(obj);
        }
        Contract::TestReport => {
            if let Some(Value::Array(items)) = obj.get_mut("acceptance_criteria_status") {
                for item in items.iter_mut().filter_map(Value::as_object_mut) {
                    let folded = take_unknown(item, CRITERION_KEYS);
                    if !folded.is_empty() {
                        append_text(item, "evidence", &folded.join("; "));
                        changed = true;
                    }
                }
            }
            if let Some(Value::Object(patch)) = obj.get_mut("recommended_patch") {
                changed |= fold_patch_unknown(patch);
            }
            let folded = take_unknown(obj, REPORT_KEYS);
            if !folded.is_empty() {
                append_text(obj, "extra", &folded.join("\n"));
                changed = true;
            }
        }
        Contract::Repair => {}
    }
    changed
}

fn fold_patch_unknown(obj: &mut Map<String, Value>) -> bool {
    let mut folded = Vec::new();
    if let Some(Value::Object(files)) = obj.get_mut("files") {
        for (path, entry) in files.iter_mut() {
            if let Some(entry) = entry.as_object_mut() {
                folded.extend(
                    take_unknown(entry, FILE_KEYS)
                        .into_iter()
                        .map(|f| format!("{path}: {f}")),
                );
            }
        }
    }
    if let Some(Value::Array(items)) = obj.get_mut("patches") {
        for entry in items.iter_mut().filter_map(Value::as_object_mut) {
            folded.extend(take_unknown(entry, DIFF_KEYS));
        }
    }
    folded.extend(take_unknown(obj, PATCH_KEYS));
    if folded.is_empty() {
        return false;
    }
    let notes = obj
        .entry("notes".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(notes) = notes {
        notes.extend(folded.into_iter().map(Value::String));
    }
    true
}

/// Remove keys outside `known`, rendered as `key: value` lines in key order.
fn take_unknown(obj: &mut Map<String, Value>, known: &[&str]) -> Vec<String> {
    let mut unknown: Vec<String> = obj
        .keys()
        .filter(|k| !known.contains(&k.as_str()))
        .cloned()
        .collect();
    unknown.sort();
    unknown
        .into_iter()
        .filter_map(|k| obj.remove(&k).map(|v| format!("{k}: {}", value_to_text(&v))))
        .collect()
}

fn append_text(obj: &mut Map<String, Value>, key: &str, text: &str) {
    let existing = obj.get(key).and_then(Value::as_str).unwrap_or_default();
    let joined = if existing.trim().is_empty() {
        text.to_string()
    } else {
        format!("{existing}\n{text}")
    };
    obj.insert(key.to_string(), Value::String(joined));
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

fn known_keys(contract: Contract) -> &'static [&'static str] {
    match contract {
        Contract::Plan => PLAN_KEYS,
        Contract::Patch => PATCH_KEYS,
        Contract::TestReport => REPORT_KEYS,
        Contract::Repair => &[],
    }
}
