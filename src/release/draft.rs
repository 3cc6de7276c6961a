//! Release title, description and notes, collected interactively or filled
//! with a placeholder for unattended runs.

use std::io::{BufRead, Write};

use crate::error::Result;
use crate::manifest::{NoteCategory, ReleaseNote};

/// The human-written part of a release entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDraft {
    pub title: String,
    pub description: String,
    pub notes: Vec<ReleaseNote>,
}

impl ReleaseDraft {
    /// Draft used by `--auto` runs.
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            title: "Maintenance release".to_string(),
            description: "Stability and performance improvements.".to_string(),
            notes: vec![ReleaseNote::new(
                NoteCategory::Fix,
                "General fixes and improvements.",
            )],
        }
    }
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> Result<Option<String>> {
    write!(output, "{label}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Splits `feat: text` into its category and text. A line without a known
/// category prefix is a feature note.
fn parse_note(line: &str) -> ReleaseNote {
    if let Some((tag, text)) = line.split_once(':')
        && let Some(category) = NoteCategory::parse(tag)
        && !text.trim().is_empty()
    {
        return ReleaseNote::new(category, text.trim());
    }
    ReleaseNote::new(NoteCategory::Feature, line)
}

/// Asks for a title, a description and any number of notes. An empty line
/// (or end of input) ends the notes. Empty answers fall back to the
/// placeholder text.
///
/// # Errors
///
/// Returns an error if reading input or writing prompts fails.
pub fn collect_draft<R: BufRead, W: Write>(mut input: R, mut output: W) -> Result<ReleaseDraft> {
    let fallback = ReleaseDraft::placeholder();

    let title = prompt(&mut input, &mut output, "Release title: ")?
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback.title);
    let description = prompt(&mut input, &mut output, "Description: ")?
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback.description);

    writeln!(
        output,
        "Notes, one per line as <feat|fix|ui|sec>: <text>. Empty line to finish."
    )?;
    let mut notes = Vec::new();
    while let Some(line) = prompt(&mut input, &mut output, "  > ")? {
        if line.is_empty() {
            break;
        }
        notes.push(parse_note(&line));
    }

    Ok(ReleaseDraft {
        title,
        description,
        notes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn collects_title_description_and_notes() {
        let input = Cursor::new(
            "Spring release\nNew job board\nfeat: Drag to reschedule\nsec: Rotate portal tokens\n\nignored\n",
        );
        let mut output = Vec::new();
        let draft = collect_draft(input, &mut output).unwrap();

        assert_eq!(draft.title, "Spring release");
        assert_eq!(draft.description, "New job board");
        assert_eq!(
            draft.notes,
            vec![
                ReleaseNote::new(NoteCategory::Feature, "Drag to reschedule"),
                ReleaseNote::new(NoteCategory::Security, "Rotate portal tokens"),
            ]
        );
        assert!(String::from_utf8(output).unwrap().contains("Release title: "));
    }

    #[test]
    fn end_of_input_uses_placeholders() {
        let draft = collect_draft(Cursor::new(""), Vec::new()).unwrap();
        assert_eq!(draft.title, "Maintenance release");
        assert_eq!(draft.description, "Stability and performance improvements.");
        assert!(draft.notes.is_empty());
    }

    #[test]
    fn unknown_category_is_a_feature_note() {
        assert_eq!(
            parse_note("perf: faster invoices"),
            ReleaseNote::new(NoteCategory::Feature, "perf: faster invoices")
        );
        assert_eq!(
            parse_note("UI: darker sidebar"),
            ReleaseNote::new(NoteCategory::Ui, "darker sidebar")
        );
        assert_eq!(
            parse_note("fix:"),
            ReleaseNote::new(NoteCategory::Feature, "fix:")
        );
    }

    #[test]
    fn placeholder_has_one_fix_note() {
        let draft = ReleaseDraft::placeholder();
        assert_eq!(draft.notes.len(), 1);
        assert_eq!(draft.notes[0].category, NoteCategory::Fix);
    }
}
