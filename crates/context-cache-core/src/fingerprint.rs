//! Order-independent feature summary of an environment snapshot.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECENT_COMMANDS_LIMIT: usize = 5;
pub const ACTIVE_PACKAGES_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Fingerprint {
    pub workspace_keys: BTreeSet<String>,
    pub recent_commands: Vec<String>,
    pub active_packages: Vec<String>,
    pub document_length: usize,
}

impl Fingerprint {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workspace_keys.is_empty()
            && self.recent_commands.is_empty()
            && self.active_packages.is_empty()
            && self.document_length == 0
    }
}

/// Reduces a snapshot to its [`Fingerprint`].
///
/// Missing or oddly shaped sections contribute nothing; a null or non-object
/// snapshot yields the empty fingerprint.
#[must_use]
pub fn fingerprint(snapshot: &Value) -> Fingerprint {
    let Value::Object(root) = snapshot else {
        return Fingerprint::default();
    };

    let workspace_keys = root
        .get("workspace_objects")
        .map(unwrap_singleton)
        .and_then(Value::as_object)
        .map(|objects| objects.keys().cloned().collect())
        .unwrap_or_default();

    let recent_commands = root
        .get("console_history")
        .and_then(Value::as_array)
        .map(|history| {
            let commands = string_entries(history);
            let skip = commands.len().saturating_sub(RECENT_COMMANDS_LIMIT);
            commands.into_iter().skip(skip).collect()
        })
        .unwrap_or_default();

    let active_packages = root
        .get("environment_info")
        .map(unwrap_singleton)
        .and_then(|info| info.get("packages"))
        .map(|packages| match packages {
            Value::Array(items) => string_entries(items)
                .into_iter()
                .take(ACTIVE_PACKAGES_LIMIT)
                .collect(),
            Value::String(single) => vec![single.clone()],
            _ => Vec::new(),
        })
        .unwrap_or_default();

    let document_length = match root.get("document_content") {
        Some(Value::String(text)) => text.chars().count(),
        Some(Value::Array(lines)) => string_entries(lines).join("\n").chars().count(),
        _ => 0,
    };

    Fingerprint {
        workspace_keys,
        recent_commands,
        active_packages,
        document_length,
    }
}

/// Average Jaccard index over the set-valued features present on either side.
///
/// Returns `0.0` when no feature is present anywhere. `document_length` does
/// not take part.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn similarity(left: &Fingerprint, right: &Fingerprint) -> f64 {
    let scores = [
        jaccard(left.workspace_keys.iter(), right.workspace_keys.iter()),
        jaccard(left.recent_commands.iter(), right.recent_commands.iter()),
        jaccard(left.active_packages.iter(), right.active_packages.iter()),
    ];

    let present = scores.iter().flatten().copied().collect::<Vec<_>>();
    if present.is_empty() {
        return 0.0;
    }
    present.iter().sum::<f64>() / present.len() as f64
}

// None when both sides are empty, so the feature is skipped.
#[allow(clippy::cast_precision_loss)]
fn jaccard<'a>(
    left: impl Iterator<Item = &'a String>,
    right: impl Iterator<Item = &'a String>,
) -> Option<f64> {
    let left = left.map(String::as_str).collect::<HashSet<_>>();
    let right = right.map(String::as_str).collect::<HashSet<_>>();
    if left.is_empty() && right.is_empty() {
        return None;
    }

    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    Some(intersection as f64 / union as f64)
}

fn unwrap_singleton(value: &Value) -> &Value {
    match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

fn string_entries(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(Value::as_str)
        .map(ToString::to_string)
        .collect()
}
