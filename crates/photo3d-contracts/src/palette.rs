//! Colour palette extraction and cross-view aggregation.
//!
//! Colours are canonicalised to upper-case `#RRGGBB`. Aggregation counts
//! every occurrence across all views and ranks by descending frequency;
//! ties keep first-seen order, where views are visited in canonical angle
//! order (front, back, left, right, top) and colours in listed order. The
//! result therefore does not depend on how the caller built its map.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::views::ViewAngle;

pub const DOMINANT_COLOR_LIMIT: usize = 7;

const SECTION_LABELS: [&str; 4] = ["colors", "colours", "palette", "color palette"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedPalette {
    pub per_view: BTreeMap<ViewAngle, Vec<String>>,
    pub unified: Vec<String>,
    pub dominant: Vec<String>,
}

impl AggregatedPalette {
    pub fn is_empty(&self) -> bool {
        self.unified.is_empty()
    }
}

/// Canonical `#RRGGBB` form of a hex colour, or `None` if it is not one.
pub fn normalize_color(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    let expanded = match digits.len() {
        6 => digits.to_string(),
        3 => digits.chars().flat_map(|ch| [ch, ch]).collect(),
        _ => return None,
    };
    Some(format!("#{}", expanded.to_ascii_uppercase()))
}

/// Combine per-view palettes into one frequency-ranked palette.
pub fn aggregate(per_view: &BTreeMap<ViewAngle, Vec<String>>) -> AggregatedPalette {
    let mut normalized_views = BTreeMap::new();
    let mut counts: IndexMap<String, usize> = IndexMap::new();

    for (angle, colors) in per_view {
        let normalized = colors
            .iter()
            .filter_map(|color| normalize_color(color))
            .collect::<Vec<String>>();
        for color in &normalized {
            *counts.entry(color.clone()).or_insert(0) += 1;
        }
        normalized_views.insert(*angle, normalized);
    }

    let mut ranked = counts.into_iter().collect::<Vec<(String, usize)>>();
    // sort_by is stable: equal counts keep first-seen order
    ranked.sort_by(|left, right| right.1.cmp(&left.1));
    let unified = ranked
        .into_iter()
        .map(|(color, _)| color)
        .collect::<Vec<String>>();
    let dominant = unified
        .iter()
        .take(DOMINANT_COLOR_LIMIT)
        .cloned()
        .collect::<Vec<String>>();

    AggregatedPalette {
        per_view: normalized_views,
        unified,
        dominant,
    }
}

/// Colours found in a model's text answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedColors {
    pub colors: Vec<String>,
    pub from_labeled_section: bool,
    pub warning: Option<String>,
}

/// Pull hex colours out of free text.
///
/// A labelled section (`COLORS: #AABBCC, ...`) wins; otherwise every
/// `#`-prefixed hex token in the text is used. The list is truncated to
/// `expected`; a shortfall is reported in `warning` but never padded,
/// because invented colours would skew the frequency ranking.
pub fn extract_colors_from_text(text: &str, expected: usize) -> ExtractedColors {
    let (mut colors, from_labeled_section) = match labeled_section(text) {
        Some(section) => {
            let found = scan_hex_tokens(section);
            if found.is_empty() {
                (scan_hex_tokens(text), false)
            } else {
                (found, true)
            }
        }
        None => (scan_hex_tokens(text), false),
    };

    let mut warning = None;
    if expected > 0 && colors.len() != expected {
        warning = Some(format!(
            "expected {expected} colors, found {}",
            colors.len()
        ));
        colors.truncate(expected);
    }

    ExtractedColors {
        colors,
        from_labeled_section,
        warning,
    }
}

fn labeled_section(text: &str) -> Option<&str> {
    let lowered = text.to_ascii_lowercase();
    for label in SECTION_LABELS {
        let mut search_from = 0;
        while let Some(offset) = lowered[search_from..].find(label) {
            let label_end = search_from + offset + label.len();
            let rest = &lowered[label_end..];
            let skipped = rest
                .chars()
                .take_while(|ch| matches!(ch, '*' | ' ' | '_'))
                .map(char::len_utf8)
                .sum::<usize>();
            if rest[skipped..].starts_with(':') {
                let start = label_end + skipped + 1;
                let end = text[start..]
                    .find("\n\n")
                    .map(|idx| start + idx)
                    .unwrap_or(text.len());
                return Some(&text[start..end]);
            }
            search_from = label_end;
        }
    }
    None
}

/// Every `#RGB` / `#RRGGBB` token, normalised, in order of appearance.
pub fn scan_hex_tokens(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'#' {
            idx += 1;
            continue;
        }
        let start = idx + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        let run = end - start;
        if run == 6 || run == 3 {
            if let Some(color) = normalize_color(&text[start..end]) {
                out.push(color);
            }
        }
        idx = end.max(start);
    }
    out
}
