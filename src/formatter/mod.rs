//! Deterministic Markdown assembly.
//!
//! Normalizes labels and contents in place on the region records, then
//! merges and joins per-page blocks into the document Markdown. Identical
//! inputs produce identical output.

mod rules;

pub use rules::{
    clean_content, convert_bullet, double_newlines, embed_formula_tag, normalize_label,
    normalize_numbering, strip_heading_decorations, unwrap_formula, wrap_formula,
};

use crate::types::{PageResult, RegionRecord};

/// How close (in normalized units) a region's left edge must be to both
/// bulleted neighbors for bullet alignment to fire.
const BULLET_ALIGN_TOLERANCE: f32 = 10.0;

/// Re-assign region indices to their position within each page.
pub fn renumber_only(pages: &mut [PageResult]) {
    for page in pages {
        for (i, region) in page.regions.iter_mut().enumerate() {
            region.index = i;
        }
    }
}

/// Format all pages: normalize the records in place and return the merged
/// document Markdown.
pub fn format_document(pages: &mut [PageResult]) -> String {
    let mut page_blocks = Vec::with_capacity(pages.len());
    for (page_index, page) in pages.iter_mut().enumerate() {
        page_blocks.push(format_page(page_index, page));
    }
    page_blocks.retain(|b: &String| !b.is_empty());
    page_blocks.join("\n\n")
}

fn format_page(page_index: usize, page: &mut PageResult) -> String {
    // Pipeline order, then per-record normalization.
    page.regions.sort_by_key(|r| r.index);
    for region in &mut page.regions {
        normalize_record(region);
    }

    // Bullet alignment: a plain text region sandwiched between two bulleted
    // neighbors at the same left edge becomes a bullet itself.
    let count = page.regions.len();
    for i in 1..count.saturating_sub(1) {
        let (left_bullet, left_x) = bullet_info(&page.regions[i - 1]);
        let (right_bullet, right_x) = bullet_info(&page.regions[i + 1]);
        let region = &page.regions[i];
        if region.native_label == "text"
            && left_bullet
            && right_bullet
            && !content_of(region).starts_with("- ")
            && (region.bbox[0] - left_x).abs() <= BULLET_ALIGN_TOLERANCE
            && (region.bbox[0] - right_x).abs() <= BULLET_ALIGN_TOLERANCE
        {
            let region = &mut page.regions[i];
            if let Some(content) = region.content.as_mut() {
                *content = format!("- {content}");
            }
        }
    }

    // Assemble blocks with the two merge rules.
    let mut blocks: Vec<String> = Vec::new();
    let mut skip_next_tag_of: Option<usize> = None;
    for i in 0..count {
        if skip_next_tag_of == Some(i) {
            skip_next_tag_of = None;
            continue;
        }
        let region = &page.regions[i];
        let content = content_of(region);

        // Formula-number absorption, in either adjacency direction.
        if region.native_label == "formula" {
            if let Some(next) = page.regions.get(i + 1) {
                if next.native_label == "formula_number" && !content_of(next).is_empty() {
                    blocks.push(embed_formula_tag(&content, content_of(next).trim()));
                    skip_next_tag_of = Some(i + 1);
                    continue;
                }
            }
        }
        if region.native_label == "formula_number" {
            if let Some(next) = page.regions.get(i + 1) {
                if next.native_label == "formula" {
                    blocks.push(embed_formula_tag(&content_of(next), content.trim()));
                    skip_next_tag_of = Some(i + 1);
                    continue;
                }
            }
        }

        // Image placeholder for content-less image regions.
        if region.native_label == "image" && content.is_empty() {
            blocks.push(format!(
                "![](page={page_index},bbox=[{},{},{},{}])",
                region.bbox[0].round() as i64,
                region.bbox[1].round() as i64,
                region.bbox[2].round() as i64,
                region.bbox[3].round() as i64
            ));
            continue;
        }

        if content.is_empty() {
            continue;
        }

        // Word-break recombination with the previous text block.
        if region.native_label == "text" {
            if let Some(last) = blocks.last_mut() {
                let hyphenated = last.ends_with('-');
                let starts_lower = content
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_lowercase() && c.is_alphabetic());
                if hyphenated && starts_lower && prev_is_text(&page.regions, i) {
                    last.pop();
                    last.push_str(&content);
                    continue;
                }
            }
        }

        blocks.push(content);
    }

    renumber_only(std::slice::from_mut(page));
    blocks.join("\n\n")
}

fn prev_is_text(regions: &[RegionRecord], i: usize) -> bool {
    i > 0 && regions[i - 1].native_label == "text"
}

fn content_of(region: &RegionRecord) -> String {
    region.content.clone().unwrap_or_default()
}

fn bullet_info(region: &RegionRecord) -> (bool, f32) {
    (
        region.native_label == "text" && content_of(region).starts_with("- "),
        region.bbox[0],
    )
}

/// Normalize one record in place: label, cleaned content, per-label
/// transforms.
fn normalize_record(region: &mut RegionRecord) {
    let native = region.native_label.clone();
    let normalized = normalize_label(&native);

    let transformed = region.content.as_ref().map(|raw| {
        let cleaned = clean_content(raw);
        match native.as_str() {
            "doc_title" => format!("# {}", strip_heading_decorations(&cleaned)),
            "paragraph_title" => format!("## {}", strip_heading_decorations(&cleaned)),
            "formula" | "display_formula" => wrap_formula(&unwrap_formula(&cleaned)),
            _ if normalized == "text" => {
                double_newlines(&normalize_numbering(&convert_bullet(&cleaned)))
            }
            _ => cleaned,
        }
    });

    // `formula_number` keeps its native label so the tag merge can find it.
    if native != "formula_number" {
        region.native_label = normalized;
    }
    region.content = transformed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PipelineTask, RegionRecord};

    fn text_region(index: usize, label: &str, content: &str) -> RegionRecord {
        region_at(index, label, content, [100.0, index as f32 * 100.0, 900.0, 100.0])
    }

    fn region_at(index: usize, label: &str, content: &str, bbox: [f32; 4]) -> RegionRecord {
        RegionRecord {
            index,
            native_label: label.to_string(),
            task: PipelineTask::Text,
            bbox,
            content: Some(content.to_string()),
        }
    }

    #[test]
    fn test_title_text_table_page() {
        let mut pages = vec![PageResult {
            regions: vec![
                text_region(0, "doc_title", "Annual Report"),
                text_region(1, "text", "Revenue grew."),
                text_region(2, "table", "<table><tr><td>1</td></tr></table>"),
            ],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(
            markdown,
            "# Annual Report\n\nRevenue grew.\n\n<table><tr><td>1</td></tr></table>"
        );
        let labels: Vec<&str> = pages[0]
            .regions
            .iter()
            .map(|r| r.native_label.as_str())
            .collect();
        assert_eq!(labels, vec!["text", "text", "table"]);
        assert_eq!(pages[0].regions[0].content.as_deref(), Some("# Annual Report"));
    }

    #[test]
    fn test_paragraph_title_strips_decorations() {
        let mut pages = vec![PageResult {
            regions: vec![text_region(0, "paragraph_title", "## 1. Intro")],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "## 1. Intro");
    }

    #[test]
    fn test_formula_rewrapped_and_tagged() {
        let mut pages = vec![PageResult {
            regions: vec![
                text_region(0, "formula", "$$E = mc^2$$"),
                text_region(1, "formula_number", "(3)"),
            ],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "$$\nE = mc^2 \\tag{(3)}\n$$");
    }

    #[test]
    fn test_word_break_recombination() {
        let mut pages = vec![PageResult {
            regions: vec![
                text_region(0, "text", "The experi-"),
                text_region(1, "text", "ment succeeded."),
            ],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "The experiment succeeded.");
    }

    #[test]
    fn test_no_merge_for_uppercase_continuation() {
        let mut pages = vec![PageResult {
            regions: vec![
                text_region(0, "text", "See Appendix A-"),
                text_region(1, "text", "Results follow."),
            ],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "See Appendix A-\n\nResults follow.");
    }

    #[test]
    fn test_bullet_alignment() {
        let mut pages = vec![PageResult {
            regions: vec![
                region_at(0, "text", "· alpha", [100.0, 0.0, 900.0, 50.0]),
                region_at(1, "text", "beta", [105.0, 60.0, 900.0, 110.0]),
                region_at(2, "text", "· gamma", [100.0, 120.0, 900.0, 170.0]),
            ],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "- alpha\n\n- beta\n\n- gamma");
    }

    #[test]
    fn test_bullet_alignment_requires_proximity() {
        let mut pages = vec![PageResult {
            regions: vec![
                region_at(0, "text", "· alpha", [100.0, 0.0, 900.0, 50.0]),
                region_at(1, "text", "beta", [300.0, 60.0, 900.0, 110.0]),
                region_at(2, "text", "· gamma", [100.0, 120.0, 900.0, 170.0]),
            ],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "- alpha\n\nbeta\n\n- gamma");
    }

    #[test]
    fn test_image_placeholder_without_content() {
        let mut pages = vec![PageResult {
            regions: vec![RegionRecord {
                index: 0,
                native_label: "image".to_string(),
                task: PipelineTask::Skip,
                bbox: [10.0, 20.0, 510.0, 420.0],
                content: None,
            }],
        }];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "![](page=0,bbox=[10,20,510,420])");
    }

    #[test]
    fn test_renumbering_after_format() {
        let mut pages = vec![PageResult {
            regions: vec![
                text_region(7, "text", "b"),
                text_region(3, "text", "a"),
            ],
        }];
        format_document(&mut pages);
        assert_eq!(pages[0].regions[0].index, 0);
        assert_eq!(pages[0].regions[1].index, 1);
        // Sorted into pipeline order first.
        assert_eq!(pages[0].regions[0].content.as_deref(), Some("a"));
    }

    #[test]
    fn test_pages_joined_with_blank_line() {
        let mut pages = vec![
            PageResult {
                regions: vec![text_region(0, "text", "page one")],
            },
            PageResult {
                regions: vec![text_region(0, "text", "page two")],
            },
        ];
        let markdown = format_document(&mut pages);
        assert_eq!(markdown, "page one\n\npage two");
        assert!(!markdown.contains("---"));
    }
}
