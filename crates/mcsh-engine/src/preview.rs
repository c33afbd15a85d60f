//! Structure-preserving previews of inter-stage data.
//!
//! A preview is a compact textual sketch of the upstream bytes: for JSON it
//! keeps the shape (container types, keys, sample values) while eliding the
//! bulk behind visible `…(+N)` markers; for anything else it falls back to
//! head truncation. The output is for an agent to read — it is not
//! guaranteed to be valid JSON.

use serde_json::Value;

/// Characters kept of any single string scalar.
const MAX_SCALAR_CHARS: usize = 24;
/// Items/keys shown per container before eliding.
const MAX_CONTAINER_ITEMS: usize = 8;
/// Nesting depth beyond which containers collapse.
const MAX_DEPTH: usize = 4;

/// Summarize `input` into at most `budget` characters.
///
/// A zero budget yields the bare truncation sentinel.
pub fn summarize(input: &str, budget: usize) -> String {
    if budget == 0 {
        return "…".to_string();
    }
    let trimmed = input.trim_end();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => clamp_chars(&render_value(&value, 0), budget),
        Err(_) => clamp_chars(trimmed, budget),
    }
}

fn render_value(value: &Value, depth: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let short: String = s.chars().take(MAX_SCALAR_CHARS).collect();
            if short.len() < s.len() {
                format!("\"{short}…\"")
            } else {
                format!("\"{short}\"")
            }
        }
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return format!("[…{} items]", items.len());
            }
            let shown: Vec<String> = items
                .iter()
                .take(MAX_CONTAINER_ITEMS)
                .map(|v| render_value(v, depth + 1))
                .collect();
            let elided = items.len().saturating_sub(MAX_CONTAINER_ITEMS);
            if elided > 0 {
                format!("[{}, …(+{elided})]", shown.join(", "))
            } else {
                format!("[{}]", shown.join(", "))
            }
        }
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return format!("{{…{} keys}}", map.len());
            }
            let shown: Vec<String> = map
                .iter()
                .take(MAX_CONTAINER_ITEMS)
                .map(|(k, v)| format!("{k}: {}", render_value(v, depth + 1)))
                .collect();
            let elided = map.len().saturating_sub(MAX_CONTAINER_ITEMS);
            if elided > 0 {
                format!("{{{}, …(+{elided})}}", shown.join(", "))
            } else {
                format!("{{{}}}", shown.join(", "))
            }
        }
    }
}

/// Cut `s` to at most `budget` characters, appending `…` when anything was
/// dropped.
fn clamp_chars(s: &str, budget: usize) -> String {
    if s.chars().count() <= budget {
        return s.to_string();
    }
    let mut out: String = s.chars().take(budget.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_emits_the_sentinel() {
        assert_eq!(summarize("anything", 0), "…");
    }

    #[test]
    fn small_json_passes_through_intact() {
        let out = summarize(r#"{"a":1,"b":2}"#, 100);
        assert!(out.starts_with('{'));
        assert!(out.contains("a: 1"));
        assert!(out.contains("b: 2"));
        assert!(!out.contains('…'));
    }

    #[test]
    fn large_array_reflects_shape_within_budget() {
        let items: Vec<String> = (0..5000)
            .map(|i| format!(r#"{{"id":{i},"name":"item-{i}"}}"#))
            .collect();
        let input = format!("[{}]", items.join(","));
        assert!(input.len() > 100 * 1024);

        let out = summarize(&input, 64);
        assert!(out.chars().count() <= 64);
        assert!(out.starts_with('['), "top-level container type survives: {out}");
        assert!(out.contains('…'), "truncation must be visible: {out}");
    }

    #[test]
    fn long_strings_are_elided() {
        let input = format!(r#"{{"text":"{}"}}"#, "x".repeat(500));
        let out = summarize(&input, 200);
        assert!(out.contains('…'));
        assert!(out.chars().count() <= 200);
    }

    #[test]
    fn deep_nesting_collapses() {
        let input = r#"{"a":{"b":{"c":{"d":{"e":{"f":1}}}}}}"#;
        let out = summarize(input, 200);
        assert!(out.contains("keys") || out.contains('…'), "deep container collapses: {out}");
    }

    #[test]
    fn non_json_input_head_truncates() {
        let input = "plain text ".repeat(100);
        let out = summarize(&input, 32);
        assert_eq!(out.chars().count(), 32);
        assert!(out.ends_with('…'));
        assert!(out.starts_with("plain text"));
    }

    #[test]
    fn object_with_many_keys_shows_elided_count() {
        let pairs: Vec<String> = (0..30).map(|i| format!(r#""k{i}":{i}"#)).collect();
        let input = format!("{{{}}}", pairs.join(","));
        let out = summarize(&input, 1000);
        assert!(out.contains("…(+22)"), "22 of 30 keys elided: {out}");
    }
}
