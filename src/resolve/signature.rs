//! Content-signature structural fallback.
//!
//! When every selector strategy fails, the recorded [`ContentSignature`]
//! describes what the element looked like: its tag, the container it lived
//! in, and text fragments (heading, price, link target...) that fingerprint
//! its content. Candidates are scored by how many fingerprint fields they
//! still match.

use crate::models::ContentSignature;
use crate::resolve::ElementHandle;

/// Outcome of scoring a candidate set against a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureMatch {
    /// Best-scoring element at `index`, matching `score` fingerprint fields.
    Match { index: usize, score: usize },
    /// No element matched even one fingerprint field.
    NoMatch,
    /// Multiple elements tied on the top score with no position tie-break.
    Ambiguous { score: usize, tied: usize },
}

/// Score `elements` against `signature` and pick the best match.
///
/// An element must match at least one fingerprint field to qualify. Ties on
/// the top score are broken by `fallback_position` when it points at one of
/// the tied elements; otherwise the tie is reported as ambiguous.
pub fn best_match(signature: &ContentSignature, elements: &[ElementHandle]) -> SignatureMatch {
    let scores: Vec<usize> = elements
        .iter()
        .map(|el| fingerprint_score(signature, el))
        .collect();

    let top = match scores.iter().copied().max() {
        Some(top) if top > 0 => top,
        _ => return SignatureMatch::NoMatch,
    };

    let tied: Vec<usize> = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == top)
        .map(|(i, _)| i)
        .collect();

    if tied.len() == 1 {
        return SignatureMatch::Match {
            index: tied[0],
            score: top,
        };
    }

    if let Some(pos) = signature.fallback_position {
        if tied.contains(&pos) {
            return SignatureMatch::Match {
                index: pos,
                score: top,
            };
        }
    }

    SignatureMatch::Ambiguous {
        score: top,
        tied: tied.len(),
    }
}

/// Count fingerprint fields the element still matches.
fn fingerprint_score(signature: &ContentSignature, element: &ElementHandle) -> usize {
    let fp = &signature.content_fingerprint;
    let mut score = 0;

    if matches_text(fp.heading.as_deref(), element) {
        score += 1;
    }
    if matches_text(fp.subheading.as_deref(), element) {
        score += 1;
    }
    if matches_attr(fp.image.as_deref(), element, &["alt", "src"]) {
        score += 1;
    }
    if matches_attr(fp.link.as_deref(), element, &["href"]) {
        score += 1;
    }
    if matches_text(fp.price.as_deref(), element) {
        score += 1;
    }
    if matches_text(fp.rating.as_deref(), element)
        || matches_attr(fp.rating.as_deref(), element, &["aria-label"])
    {
        score += 1;
    }

    score
}

fn matches_text(needle: Option<&str>, element: &ElementHandle) -> bool {
    match needle {
        Some(needle) if !needle.is_empty() => contains_ci(&element.text, needle),
        _ => false,
    }
}

fn matches_attr(needle: Option<&str>, element: &ElementHandle, attrs: &[&str]) -> bool {
    let needle = match needle {
        Some(n) if !n.is_empty() => n,
        _ => return false,
    };
    attrs.iter().any(|attr| {
        element
            .attributes
            .get(*attr)
            .map(|v| contains_ci(v, needle))
            .unwrap_or(false)
    })
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
