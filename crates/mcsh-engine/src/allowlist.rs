//! The shell command allow-list.
//!
//! This is the only line of defense against arbitrary subprocess execution:
//! a compile-time constant, never mutated at runtime. Every entry is a pure
//! or read-only text utility with no network or filesystem-mutating
//! capability in typical distributions. Commands that only generate
//! hardcoded text (echo, printf) are deliberately absent so that all data
//! enters a pipeline from a real source.

/// Commands a pipeline may spawn, in the order reported to agents.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "jq", "grep", "sed", "awk", "sort", "uniq", "cut", "wc", "head", "tail", "tr", "date", "bc",
    "paste", "shuf", "join", "sleep",
];

/// Whether `name` may be spawned as a subprocess.
pub fn is_allowed(name: &str) -> bool {
    ALLOWED_COMMANDS.contains(&name)
}

/// The allow-list in declaration order.
pub fn commands() -> &'static [&'static str] {
    ALLOWED_COMMANDS
}
