//! Mapping filter — keyword and signature matching.

use crate::config::ChannelMapping;

/// Decide whether a message qualifies for relay under a mapping.
///
/// Every configured keyword must appear in the text (case-insensitive
/// substring — all of them, not any), and the signature, when configured,
/// must appear as well. An empty keyword list and an empty signature each
/// pass vacuously, so a mapping with no criteria relays everything,
/// including media posts with empty captions.
pub fn matches(mapping: &ChannelMapping, text: &str) -> bool {
    let text_lower = text.to_lowercase();

    let keywords_satisfied = mapping
        .keywords
        .iter()
        .all(|keyword| text_lower.contains(&keyword.to_lowercase()));

    let signature_satisfied =
        mapping.signature.is_empty() || text_lower.contains(&mapping.signature.to_lowercase());

    keywords_satisfied && signature_satisfied
}
