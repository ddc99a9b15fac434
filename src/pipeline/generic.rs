//! Conversion for documents that need no PDF extraction.
//!
//! | Kind | Output |
//! |------|--------|
//! | plain text | cleaned text |
//! | Markdown | passed through with normalised line endings |
//! | CSV | GFM pipe table, first row as header |
//! | JSON | pretty-printed inside a ```` ```json ```` fence |

use crate::error::ServiceError;
use crate::pipeline::input::DocumentKind;
use crate::pipeline::postprocess::{clean_page_text, ensure_final_newline};

/// Convert a non-PDF document to Markdown.
pub fn convert(kind: DocumentKind, bytes: &[u8]) -> Result<String, ServiceError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ServiceError::Conversion {
        detail: format!("document is not valid UTF-8: {e}"),
    })?;
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(text);

    let markdown = match kind {
        DocumentKind::PlainText => clean_page_text(text),
        DocumentKind::Markdown => text.replace("\r\n", "\n"),
        DocumentKind::Csv => csv_to_table(text)?,
        DocumentKind::Json => json_to_block(text)?,
        DocumentKind::Pdf => {
            return Err(ServiceError::Internal(
                "PDF documents go through the extractor".into(),
            ))
        }
    };
    Ok(ensure_final_newline(&markdown))
}

fn json_to_block(text: &str) -> Result<String, ServiceError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ServiceError::Conversion {
            detail: format!("invalid JSON: {e}"),
        })?;
    let pretty = serde_json::to_string_pretty(&value)
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok(format!("```json\n{pretty}\n```"))
}

fn csv_to_table(text: &str) -> Result<String, ServiceError> {
    let rows = parse_csv(text)?;
    let Some(header) = rows.first() else {
        return Ok(String::new());
    };
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let render = |row: &[String]| -> String {
        let mut cells: Vec<String> = row.iter().map(|c| escape_cell(c)).collect();
        cells.resize(width, String::new());
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = vec![render(header)];
    lines.push(format!("|{}", " --- |".repeat(width)));
    lines.extend(rows[1..].iter().map(|r| render(r)));
    Ok(lines.join("\n"))
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', "<br>")
}

/// RFC 4180 reader: quoted fields may hold commas, newlines and `""`.
fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, ServiceError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(ServiceError::Conversion {
            detail: "CSV has an unterminated quoted field".into(),
        });
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    Ok(rows)
}
