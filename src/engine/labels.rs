//! Label resolution
//!
//! Maps a numeric class index to a human-readable label. Preference order:
//! the artifact's own embedded name table, then the process-wide external
//! table, then the stringified index. Resolution never fails.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Process-wide class-name table, populated at most once.
static CLASS_NAMES: OnceLock<Vec<String>> = OnceLock::new();

/// Default filename of the external class-name table.
const CLASS_NAMES_FILE: &str = "class_names.json";

fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(CLASS_NAMES_FILE));
        }
    }
    candidates.push(PathBuf::from(CLASS_NAMES_FILE));
    candidates
}

/// Populate the process-wide table from an external JSON array of strings.
///
/// Idempotent: the first successful load wins and later calls are no-ops.
/// Returns whether a table is available afterwards.
pub fn load_class_names(path: Option<&Path>) -> bool {
    if CLASS_NAMES.get().is_some() {
        return true;
    }

    let candidates = match path {
        Some(p) => vec![p.to_path_buf()],
        None => candidate_paths(),
    };

    for candidate in &candidates {
        let raw = match std::fs::read_to_string(candidate) {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(names) => {
                debug!(
                    "loaded {} class names from {}",
                    names.len(),
                    candidate.display()
                );
                let _ = CLASS_NAMES.set(names);
                return true;
            }
            Err(e) => warn!(
                "class-name table {} is not a JSON array of strings: {}",
                candidate.display(),
                e
            ),
        }
    }
    false
}

/// The external table, if one has been loaded.
pub fn class_names() -> Option<&'static [String]> {
    CLASS_NAMES.get().map(|names| names.as_slice())
}

/// Resolve a class index to a label. Never fails.
pub fn resolve(index: usize, embedded: Option<&[String]>) -> String {
    resolve_with(index, embedded, class_names())
}

fn resolve_with(index: usize, embedded: Option<&[String]>, external: Option<&[String]>) -> String {
    if let Some(name) = embedded.and_then(|names| names.get(index)) {
        return name.clone();
    }
    if let Some(name) = external.and_then(|names| names.get(index)) {
        return name.clone();
    }
    index.to_string()
}

/// Parse an exporter's `names` metadata value into an ordered table.
///
/// The value arrives as the exporter's map literal, e.g.
/// `{0: 'angry', 1: 'happy'}`. Entries are sorted by index.
pub fn parse_embedded_names(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut entries: Vec<(usize, String)> = Vec::new();
    for part in body.split(',') {
        let (index, name) = part.split_once(':')?;
        let index: usize = index.trim().parse().ok()?;
        let name = name
            .trim()
            .trim_matches(|c| c == '\'' || c == '"')
            .to_string();
        entries.push((index, name));
    }
    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|(index, _)| *index);
    Some(entries.into_iter().map(|(_, name)| name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_embedded_names_win_over_external() {
        let embedded = table(&["angry", "happy"]);
        let external = table(&["x", "y"]);
        assert_eq!(
            resolve_with(1, Some(&embedded), Some(&external)),
            "happy".to_string()
        );
    }

    #[test]
    fn test_external_table_used_when_no_embedded() {
        let external = table(&["neutral", "sad"]);
        assert_eq!(resolve_with(1, None, Some(&external)), "sad".to_string());
    }

    #[test]
    fn test_out_of_range_index_falls_back_to_stringified() {
        let external = table(&["neutral"]);
        assert_eq!(resolve_with(5, None, Some(&external)), "5".to_string());
        assert_eq!(resolve_with(3, None, None), "3".to_string());
    }

    #[test]
    fn test_embedded_out_of_range_falls_through_to_external() {
        let embedded = table(&["only"]);
        let external = table(&["a", "b", "c"]);
        assert_eq!(
            resolve_with(2, Some(&embedded), Some(&external)),
            "c".to_string()
        );
    }

    #[test]
    fn test_parse_embedded_names_map_literal() {
        let parsed = parse_embedded_names("{0: 'angry', 1: 'happy', 2: 'sad'}").unwrap();
        assert_eq!(parsed, table(&["angry", "happy", "sad"]));
    }

    #[test]
    fn test_parse_embedded_names_unordered_and_double_quoted() {
        let parsed = parse_embedded_names(r#"{1: "happy", 0: "angry"}"#).unwrap();
        assert_eq!(parsed, table(&["angry", "happy"]));
    }

    #[test]
    fn test_parse_embedded_names_rejects_garbage() {
        assert!(parse_embedded_names("").is_none());
        assert!(parse_embedded_names("[0, 1]").is_none());
        assert!(parse_embedded_names("{}").is_none());
    }
}
