//! Text-level formatting rules shared by the page assembler.

use once_cell::sync::Lazy;
use regex::Regex;

static DOT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{4,}").expect("valid regex"));
static MIDDOT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"·{4,}").expect("valid regex"));
static UNDERSCORE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{4,}").expect("valid regex"));
static ESCAPED_UNDERSCORE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\\_){4,}").expect("valid regex"));
static HEADING_DECORATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:#+\s*|-\s+|\*\s+)+").expect("valid regex"));
static LEADING_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[·•*]\s*").expect("valid regex"));
static FULLWIDTH_PAREN_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^（([0-9０-９]+)）\s*").expect("valid regex"));
static HALF_OPEN_PAREN_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?([0-9]+)[)）]\s*").expect("valid regex"));
static LETTER_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z])[.．)）]\s+").expect("valid regex"));
static NEWLINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").expect("valid regex"));

/// Clean a recognized content string: trim outer whitespace and stray tabs,
/// and collapse leader runs (`.`, `·`, `_`, `\_`) to their canonical
/// three-character form.
#[must_use]
pub fn clean_content(content: &str) -> String {
    let trimmed = content.trim().trim_matches('\t').trim();
    let out = DOT_RUN.replace_all(trimmed, "...");
    let out = MIDDOT_RUN.replace_all(&out, "···");
    let out = UNDERSCORE_RUN.replace_all(&out, "___");
    let out = ESCAPED_UNDERSCORE_RUN.replace_all(&out, r"\_\_\_");
    out.into_owned()
}

/// Map a native region label to the formatter's working set
/// `{text, table, formula, image}`, keeping unknown labels native.
#[must_use]
pub fn normalize_label(native: &str) -> String {
    match native {
        "text" | "doc_title" | "paragraph_title" | "abstract" | "content" | "figure_title"
        | "table_title" | "chart_title" | "reference" | "reference_content" | "footnote"
        | "vision_footnote" | "algorithm" | "aside_text" => "text".to_string(),
        "table" => "table".to_string(),
        "formula" | "display_formula" => "formula".to_string(),
        "image" | "chart" => "image".to_string(),
        other => other.to_string(),
    }
}

/// Strip any leading `#`, `- `, `* ` decorations from a title.
#[must_use]
pub fn strip_heading_decorations(content: &str) -> String {
    HEADING_DECORATION.replace(content, "").into_owned()
}

/// Unwrap `$$…$$`, `\[…\]`, and `\(…\)` delimiters around a formula body.
#[must_use]
pub fn unwrap_formula(content: &str) -> String {
    let trimmed = content.trim();
    for (open, close) in [("$$", "$$"), (r"\[", r"\]"), (r"\(", r"\)")] {
        if trimmed.len() >= open.len() + close.len()
            && trimmed.starts_with(open)
            && trimmed.ends_with(close)
        {
            return trimmed[open.len()..trimmed.len() - close.len()]
                .trim()
                .to_string();
        }
    }
    trimmed.to_string()
}

/// Wrap a formula body in display math with its own lines.
#[must_use]
pub fn wrap_formula(body: &str) -> String {
    format!("$$\n{body}\n$$")
}

/// Embed a `\tag{…}` just before the closing delimiter of a wrapped
/// formula.
#[must_use]
pub fn embed_formula_tag(wrapped: &str, tag: &str) -> String {
    match wrapped.rfind("\n$$") {
        Some(pos) => format!("{} \\tag{{{tag}}}{}", &wrapped[..pos], &wrapped[pos..]),
        None => format!("{wrapped} \\tag{{{tag}}}"),
    }
}

/// Convert a leading `·`/`•`/`*` bullet to `- `.
#[must_use]
pub fn convert_bullet(content: &str) -> String {
    if LEADING_BULLET.is_match(content) {
        LEADING_BULLET.replace(content, "- ").into_owned()
    } else {
        content.to_string()
    }
}

/// Normalize leading list numbering to canonical ASCII forms:
/// `（1）`/`1）` become `(1)`, `A．`/`a)` become `A.`/`a)`.
#[must_use]
pub fn normalize_numbering(content: &str) -> String {
    if let Some(caps) = FULLWIDTH_PAREN_NUMBER.captures(content) {
        let digits: String = caps[1]
            .chars()
            .map(|c| {
                // Full-width digits to ASCII.
                if ('０'..='９').contains(&c) {
                    char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c)
                } else {
                    c
                }
            })
            .collect();
        return format!("({digits}) {}", &content[caps[0].len()..]);
    }
    if let Some(caps) = HALF_OPEN_PAREN_NUMBER.captures(content) {
        return format!("({}) {}", &caps[1], &content[caps[0].len()..]);
    }
    if let Some(caps) = LETTER_MARKER.captures(content) {
        let marker = &caps[1];
        let rest = &content[caps[0].len()..];
        // `A.` and `a)` both normalize to a dot marker.
        return format!("{marker}. {rest}");
    }
    content.to_string()
}

/// Double single newlines so paragraphs separate with a blank line; longer
/// runs are left alone.
#[must_use]
pub fn double_newlines(content: &str) -> String {
    NEWLINE_RUN
        .replace_all(content, |caps: &regex::Captures<'_>| {
            if caps[0].len() == 1 {
                "\n\n".to_string()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}
