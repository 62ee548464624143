//! Page-state fingerprinting.
//!
//! Two visits to the same logical page must collide even when dynamic content
//! (timestamps, counters, ids, prices) differs. The hasher masks dynamic
//! substrings, extracts a structural feature set from the accessibility tree,
//! and folds it into a 64-bit locality-sensitive fingerprint. Fingerprints
//! within a small Hamming distance denote the same state.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::browser::AxNode;

/// Sentinel substituted for masked dynamic content.
const MASK: &str = "#";

/// Default Hamming distance at or below which two hashes are the same state.
pub const DEFAULT_HAMMING_THRESHOLD: u32 = 3;

fn mask_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // UUIDs
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            // ISO timestamps, then bare dates and clock times
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2})?(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
            r"\d{4}-\d{2}-\d{2}",
            r"\d{1,2}/\d{1,2}/\d{2,4}",
            r"\b\d{1,2}:\d{2}(:\d{2})?\s*(AM|PM|am|pm)?\b",
            // Currency amounts
            r"[$\u{20ac}\u{a3}\u{a5}]\s?\d[\d,]*(\.\d+)?",
            // Count phrases ("3 items", "12 results", "5 new messages")
            r"(?i)\b\d[\d,]*\s+(new\s+)?(items?|results?|messages?|notifications?|comments?|views?|likes?|followers?|points?)\b",
            // Remaining digit runs
            r"\d[\d,]*",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid mask regex"))
        .collect()
    })
}

/// Replace dynamic substrings (dates, times, ids, currency, counts) with a
/// sentinel so they do not contribute to the state identity.
pub fn mask_dynamic(text: &str) -> String {
    let mut masked = text.to_string();
    for regex in mask_regexes() {
        masked = regex.replace_all(&masked, MASK).into_owned();
    }
    masked
}

/// A 64-bit locality-sensitive state fingerprint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StateHash(pub u64);

impl StateHash {
    /// Hamming distance to another fingerprint.
    pub fn distance(&self, other: &StateHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Similarity in [0, 1]; 1.0 means identical.
    pub fn similarity(&self, other: &StateHash) -> f64 {
        1.0 - (self.distance(other) as f64 / 64.0)
    }

    /// Whether the two fingerprints denote the same logical state.
    pub fn same_state(&self, other: &StateHash, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }

    /// Parse from the hex form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Extract the structural feature set of a tree: one `role:` and one masked
/// `name:` feature per node, plus a `children:N@depth` shape feature.
pub fn extract_features(node: &AxNode) -> Vec<String> {
    let mut features = Vec::new();
    extract_features_inner(node, 0, &mut features);
    features
}

fn extract_features_inner(node: &AxNode, depth: usize, out: &mut Vec<String>) {
    if !node.role.is_empty() {
        out.push(format!("role:{}", node.role));
    }
    if !node.name.is_empty() {
        out.push(format!("name:{}", mask_dynamic(&node.name)));
    }
    if let Some(value) = &node.value {
        if !value.is_empty() {
            out.push(format!("value:{}", mask_dynamic(value)));
        }
    }
    if !node.children.is_empty() {
        out.push(format!("children:{}@{}", node.children.len(), depth));
    }
    for child in &node.children {
        extract_features_inner(child, depth + 1, out);
    }
}

fn feature_hash(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    u64::from_le_bytes(
        digest[..8]
            .try_into()
            .expect("digest has at least 8 bytes"),
    )
}

/// SimHash over a feature list: each feature votes on all 64 bit positions,
/// the sign of the tally decides each output bit.
pub fn simhash(features: &[String]) -> StateHash {
    let mut tally = [0i64; 64];

    for feature in features {
        let hash = feature_hash(feature);
        for (bit, slot) in tally.iter_mut().enumerate() {
            if hash & (1u64 << bit) != 0 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }

    let mut result = 0u64;
    for (bit, &slot) in tally.iter().enumerate() {
        if slot > 0 {
            result |= 1u64 << bit;
        }
    }
    StateHash(result)
}

/// Fingerprint a page from its accessibility tree.
pub fn hash_page(tree: &AxNode) -> StateHash {
    simhash(&extract_features(tree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::AxNode;
    use pretty_assertions::assert_eq;

    fn page(timestamp: &str, cart_count: &str) -> AxNode {
        AxNode::new("main", "").with_children(vec![
            AxNode::new("heading", "Orders"),
            AxNode::new("paragraph", format!("Last updated {}", timestamp)),
            AxNode::new("button", format!("Cart ({} items)", cart_count)),
            AxNode::new("link", "Account"),
        ])
    }

    #[test]
    fn test_mask_dates_and_times() {
        assert_eq!(mask_dynamic("updated 2024-01-15T10:30:00Z"), "updated #");
        assert_eq!(mask_dynamic("due 2024-01-15"), "due #");
        assert_eq!(mask_dynamic("at 10:45 PM"), "at #");
    }

    #[test]
    fn test_mask_currency_and_counts() {
        assert_eq!(mask_dynamic("Total: $1,234.56"), "Total: #");
        assert_eq!(mask_dynamic("3 items in cart"), "# in cart");
        assert_eq!(mask_dynamic("12 results found"), "# found");
    }

    #[test]
    fn test_mask_uuid() {
        assert_eq!(
            mask_dynamic("order a1b2c3d4-e5f6-7890-abcd-ef1234567890 ready"),
            "order # ready"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let tree = page("2024-01-15T10:30:00Z", "3");
        assert_eq!(hash_page(&tree), hash_page(&tree));
    }

    #[test]
    fn test_dynamic_content_does_not_change_hash() {
        let first = page("2024-01-15T10:30:00Z", "3");
        let second = page("2025-06-02T08:01:44Z", "17");
        assert_eq!(hash_page(&first), hash_page(&second));
    }

    #[test]
    fn test_different_structure_changes_hash() {
        let first = page("2024-01-15T10:30:00Z", "3");
        let other = AxNode::new("main", "").with_children(vec![
            AxNode::new("heading", "Login"),
            AxNode::new("textbox", "Email"),
            AxNode::new("textbox", "Password"),
            AxNode::new("button", "Sign in"),
        ]);
        let distance = hash_page(&first).distance(&hash_page(&other));
        assert!(distance > DEFAULT_HAMMING_THRESHOLD);
    }

    #[test]
    fn test_same_state_threshold() {
        let a = StateHash(0b1010);
        let b = StateHash(0b1011);
        assert_eq!(a.distance(&b), 1);
        assert!(a.same_state(&b, DEFAULT_HAMMING_THRESHOLD));

        let far = StateHash(!a.0);
        assert_eq!(a.distance(&far), 64);
        assert!(!a.same_state(&far, DEFAULT_HAMMING_THRESHOLD));
    }

    #[test]
    fn test_similarity() {
        let a = StateHash(0);
        assert_eq!(a.similarity(&a), 1.0);
        assert_eq!(a.similarity(&StateHash(u64::MAX)), 0.0);
    }

    #[test]
    fn test_display_parse_round_trip() {
        let hash = StateHash(0xdead_beef_0123_4567);
        let parsed = StateHash::parse(&hash.to_string()).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_features_include_shape() {
        let tree = page("2024-01-15", "3");
        let features = extract_features(&tree);
        assert!(features.contains(&"role:heading".to_string()));
        assert!(features.contains(&"children:4@0".to_string()));
        // Masked name, not the raw timestamp
        assert!(features.contains(&"name:Last updated #".to_string()));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hashing_is_stable(names in proptest::collection::vec("[a-z ]{0,12}", 1..6)) {
                let tree = AxNode::new("main", "").with_children(
                    names.iter().map(|n| AxNode::new("button", n.clone())).collect(),
                );
                prop_assert_eq!(hash_page(&tree), hash_page(&tree));
            }

            #[test]
            fn masked_digits_collide(a in 0u32..1_000_000, b in 0u32..1_000_000) {
                let make = |n: u32| {
                    AxNode::new("main", "").with_children(vec![
                        AxNode::new("heading", "Inbox"),
                        AxNode::new("paragraph", format!("{} messages", n)),
                    ])
                };
                prop_assert_eq!(hash_page(&make(a)), hash_page(&make(b)));
            }
        }
    }
}
