//! Footer composer — appends the session's footer to final text.

use std::sync::Arc;

use tracing::warn;

use crate::config::RelayConfig;
use crate::mode::FooterSelection;

/// Separator between the message body and the footer.
const SEPARATOR: &str = "\n\n";

/// Appends the configured footer after rewriting and length enforcement.
///
/// Footer content is not subject to the caption cap — keeping footers
/// short is the operator's responsibility.
pub struct FooterComposer {
    config: Arc<RelayConfig>,
}

impl FooterComposer {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self { config }
    }

    /// Apply the session's footer selection to `text`.
    ///
    /// A saved footer whose name no longer resolves degrades to no footer
    /// with a warning — never a failure.
    pub fn apply(&self, text: &str, selection: &FooterSelection) -> String {
        let content = match selection {
            FooterSelection::None => return text.to_string(),
            FooterSelection::Custom(content) => content.as_str(),
            FooterSelection::Saved(name) => match self.config.footer_by_name(name) {
                Some(footer) => footer.content.as_str(),
                None => {
                    warn!(footer = %name, "Saved footer not found, forwarding without footer");
                    return text.to_string();
                }
            },
        };

        if content.is_empty() {
            return text.to_string();
        }
        if text.is_empty() {
            // Media post with an empty caption: the footer stands alone.
            return content.to_string();
        }
        format!("{text}{SEPARATOR}{content}")
    }
}
