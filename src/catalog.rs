//! Scan results: the ordered list of clickable candidates on a page.
//!
//! A catalog is built fresh on every scan and never mutated in place; indices
//! are stable only within one scan. The operator's choice is copied out into a
//! [`Selection`] so it survives after the catalog is replaced.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::driver::RawClickable;

/// Maximum label length kept from the element's visible text.
const LABEL_MAX: usize = 60;

/// Rough shape of a clickable element, derived from its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Link,
    Button,
    Unknown,
}

impl ElementKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "a" => ElementKind::Link,
            "button" | "input" => ElementKind::Button,
            _ => ElementKind::Unknown,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Link => "link",
            ElementKind::Button => "button",
            ElementKind::Unknown => "unknown",
        }
    }
}

/// One clickable target discovered by a scan.
#[derive(Debug, Clone)]
pub struct CandidateElement {
    /// Zero-based index, stable within this scan only.
    pub index: usize,
    /// Display label derived from the element's visible text.
    pub label: String,
    /// Locator usable to re-find the element after navigation.
    pub selector: String,
    pub kind: ElementKind,
}

impl fmt::Display for CandidateElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] <{}>", self.index, self.kind.as_str())?;
        if !self.label.is_empty() {
            write!(f, " \"{}\"", self.label)?;
        }
        Ok(())
    }
}

/// A copy of one candidate's addressing info, decoupled from the transient
/// catalog. Navigation invalidates DOM handles, so the loop re-resolves this
/// selector on every use instead of holding a live handle.
#[derive(Debug, Clone)]
pub struct Selection {
    pub selector: String,
    pub label: String,
}

/// What to do when a selector resolves to more than one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Click the first match. Site layouts legitimately repeat labelled
    /// elements, and at release time a click beats a diagnostic.
    #[default]
    FirstMatch,
    /// Refuse to click and report how many elements matched.
    Strict,
}

/// The result of one scan: a finite, ordered, immutable set of candidates.
#[derive(Debug, Clone, Default)]
pub struct ElementCatalog {
    elements: Vec<CandidateElement>,
}

impl ElementCatalog {
    /// Build a catalog from the driver's raw query results, assigning indices
    /// in document order. An empty result set is a valid catalog.
    pub fn from_raw(raw: Vec<RawClickable>) -> Self {
        let elements = raw
            .into_iter()
            .enumerate()
            .map(|(index, r)| CandidateElement {
                index,
                label: derive_label(&r.text, &r.selector),
                selector: r.selector,
                kind: ElementKind::from_tag(&r.tag),
            })
            .collect();
        Self { elements }
    }

    pub fn get(&self, index: usize) -> Option<&CandidateElement> {
        self.elements.get(index)
    }

    pub fn elements(&self) -> &[CandidateElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Copy out the addressing info for one candidate.
    pub fn selection(&self, index: usize) -> Option<Selection> {
        self.elements.get(index).map(|el| Selection {
            selector: el.selector.clone(),
            label: el.label.clone(),
        })
    }

    /// Compact one-line-per-element listing for the operator.
    pub fn listing(&self) -> String {
        let mut out = String::with_capacity(self.elements.len() * 40);
        for el in &self.elements {
            out.push_str(&el.to_string());
            out.push('\n');
        }
        out
    }

    /// First element whose label contains `needle` (case-insensitive).
    pub fn find_by_text(&self, needle: &str) -> Option<usize> {
        let needle = needle.to_lowercase();
        self.elements
            .iter()
            .find(|el| el.label.to_lowercase().contains(&needle))
            .map(|el| el.index)
    }

    /// Indices of candidates that look like booking targets: labels carrying
    /// a clock time ("07:30") or the word "book".
    pub fn likely_slots(&self) -> Vec<usize> {
        self.elements
            .iter()
            .filter(|el| looks_like_slot(&el.label))
            .map(|el| el.index)
            .collect()
    }
}

fn derive_label(text: &str, selector: &str) -> String {
    let trimmed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        return selector.chars().take(LABEL_MAX).collect();
    }
    if trimmed.chars().count() > LABEL_MAX {
        let head: String = trimmed.chars().take(LABEL_MAX - 3).collect();
        format!("{head}...")
    } else {
        trimmed
    }
}

fn looks_like_slot(label: &str) -> bool {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let re = TIME_RE.get_or_init(|| Regex::new(r"\b\d{1,2}:\d{2}\b").expect("valid regex"));
    re.is_match(label) || label.to_lowercase().contains("book")
}
