//! Formatting helpers for console output: byte sizes and release summaries.

use std::fmt::Write as _;

use crate::manifest::ReleaseEntry;

/// Formats a byte count as a human-readable string (B, KB, MB, GB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Renders a release entry the way the update notice lists it:
/// a header line, the description, then one `[tag] text` line per note.
#[must_use]
pub fn release_summary(entry: &ReleaseEntry) -> String {
    let mut out = format!(
        "v{} ({}, {}) {}\n",
        entry.version, entry.kind, entry.date, entry.title
    );
    if !entry.description.is_empty() {
        let _ = writeln!(out, "  {}", entry.description);
    }
    for note in &entry.notes {
        let _ = writeln!(out, "  [{}] {}", note.category.tag(), note.text);
    }
    out
}
