//! Processing modes — the four-axis session mode and its derived policy.
//!
//! A session runs in exactly one of 36 modes: the product of
//! {historical, live, both} × {media on, off} × {captions-only AI, all-AI}
//! × {saved, custom, no footer}. The ordinal exists for display and logs
//! only; all runtime branching goes through the decomposed [`SessionPolicy`]
//! accessors so no code path ever switches on a mode number.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Which scan sources a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeScope {
    /// One bounded backfill pass, then stop.
    Historical,
    /// Continuous polling only.
    Live,
    /// Backfill once, poll continuously.
    Both,
}

impl FromStr for TimeScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "historical" => Ok(Self::Historical),
            "live" => Ok(Self::Live),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::InvalidValue {
                key: "time_scope".to_string(),
                message: format!("expected historical|live|both, got '{other}'"),
            }),
        }
    }
}

/// Which messages the AI rewriter applies to.
///
/// Captions are always rewritten regardless of scope — the scope only
/// controls plain text messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AiScope {
    CaptionsOnly,
    AllMessages,
}

impl FromStr for AiScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "captions" | "captions-only" => Ok(Self::CaptionsOnly),
            "all" | "all-messages" => Ok(Self::AllMessages),
            other => Err(ConfigError::InvalidValue {
                key: "ai_scope".to_string(),
                message: format!("expected captions|all, got '{other}'"),
            }),
        }
    }
}

/// The kind of footer a session appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FooterKind {
    Saved,
    Custom,
    None,
}

/// A session's processing mode — an immutable four-axis tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessingMode {
    pub time_scope: TimeScope,
    pub media_enabled: bool,
    pub ai_scope: AiScope,
    pub footer_kind: FooterKind,
}

impl ProcessingMode {
    pub fn resolve(
        time_scope: TimeScope,
        media_enabled: bool,
        ai_scope: AiScope,
        footer_kind: FooterKind,
    ) -> Self {
        Self {
            time_scope,
            media_enabled,
            ai_scope,
            footer_kind,
        }
    }

    /// Display ordinal 1–36, lexicographic over
    /// (time scope, media, AI scope, footer kind). Derived, never stored.
    pub fn ordinal(&self) -> u8 {
        let ts = match self.time_scope {
            TimeScope::Historical => 0u8,
            TimeScope::Live => 1,
            TimeScope::Both => 2,
        };
        let media = u8::from(self.media_enabled);
        let ai = match self.ai_scope {
            AiScope::CaptionsOnly => 0u8,
            AiScope::AllMessages => 1,
        };
        let footer = match self.footer_kind {
            FooterKind::Saved => 0u8,
            FooterKind::Custom => 1,
            FooterKind::None => 2,
        };
        ts * 12 + media * 6 + ai * 3 + footer + 1
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.time_scope {
            TimeScope::Historical => "historical",
            TimeScope::Live => "live",
            TimeScope::Both => "historical+live",
        };
        let media = if self.media_enabled { "media" } else { "no media" };
        let ai = match self.ai_scope {
            AiScope::CaptionsOnly => "AI on captions",
            AiScope::AllMessages => "AI on all messages",
        };
        let footer = match self.footer_kind {
            FooterKind::Saved => "saved footer",
            FooterKind::Custom => "custom footer",
            FooterKind::None => "no footer",
        };
        write!(f, "mode {}/36 ({scope}, {media}, {ai}, {footer})", self.ordinal())
    }
}

/// The footer content resolved for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FooterSelection {
    None,
    /// Named footer, resolved from configuration at apply time.
    Saved(String),
    /// Ad-hoc content captured at session start.
    Custom(String),
}

impl FooterSelection {
    pub fn kind(&self) -> FooterKind {
        match self {
            Self::None => FooterKind::None,
            Self::Saved(_) => FooterKind::Saved,
            Self::Custom(_) => FooterKind::Custom,
        }
    }

    /// Parse `none`, `saved:<name>`, or `custom:<content>`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if s.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }
        if let Some(name) = s.strip_prefix("saved:") {
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "footer".to_string(),
                    message: "saved footer name must not be empty".to_string(),
                });
            }
            return Ok(Self::Saved(name.to_string()));
        }
        if let Some(content) = s.strip_prefix("custom:") {
            return Ok(Self::Custom(content.to_string()));
        }
        Err(ConfigError::InvalidValue {
            key: "footer".to_string(),
            message: format!("expected none|saved:<name>|custom:<content>, got '{s}'"),
        })
    }
}

/// Immutable per-session policy, threaded through the pipeline and the
/// watch loop. Replaces any notion of mutable global session state.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub mode: ProcessingMode,
    pub footer: FooterSelection,
    /// Session-wide AI system prompt override. Mapping-level
    /// `prompt_template` fills in when this is absent.
    pub system_prompt: Option<String>,
}

impl SessionPolicy {
    /// Build a policy; the footer selection must agree with the mode's
    /// footer axis.
    pub fn new(
        mode: ProcessingMode,
        footer: FooterSelection,
        system_prompt: Option<String>,
    ) -> Result<Self, ConfigError> {
        if footer.kind() != mode.footer_kind {
            return Err(ConfigError::InvalidValue {
                key: "footer".to_string(),
                message: format!(
                    "footer selection {:?} does not match mode footer kind {:?}",
                    footer.kind(),
                    mode.footer_kind
                ),
            });
        }
        Ok(Self {
            mode,
            footer,
            system_prompt,
        })
    }

    pub fn run_historical(&self) -> bool {
        matches!(self.mode.time_scope, TimeScope::Historical | TimeScope::Both)
    }

    pub fn run_live(&self) -> bool {
        matches!(self.mode.time_scope, TimeScope::Live | TimeScope::Both)
    }

    pub fn download_media(&self) -> bool {
        self.mode.media_enabled
    }

    pub fn ai_applies_to_regular_text(&self) -> bool {
        self.mode.ai_scope == AiScope::AllMessages
    }

    /// Captions are always eligible for rewriting, whatever the AI scope.
    pub fn ai_applies_to_captions(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn all_modes() -> Vec<ProcessingMode> {
        let mut modes = Vec::new();
        for ts in [TimeScope::Historical, TimeScope::Live, TimeScope::Both] {
            for media in [false, true] {
                for ai in [AiScope::CaptionsOnly, AiScope::AllMessages] {
                    for footer in [FooterKind::Saved, FooterKind::Custom, FooterKind::None] {
                        modes.push(ProcessingMode::resolve(ts, media, ai, footer));
                    }
                }
            }
        }
        modes
    }

    #[test]
    fn ordinal_is_a_bijection_over_all_36_modes() {
        let modes = all_modes();
        assert_eq!(modes.len(), 36);
        let ordinals: BTreeSet<u8> = modes.iter().map(ProcessingMode::ordinal).collect();
        assert_eq!(ordinals.len(), 36);
        assert_eq!(*ordinals.first().unwrap(), 1);
        assert_eq!(*ordinals.last().unwrap(), 36);
    }

    #[test]
    fn ordinal_is_lexicographic() {
        // First axis combination → 1, last → 36.
        let first = ProcessingMode::resolve(
            TimeScope::Historical,
            false,
            AiScope::CaptionsOnly,
            FooterKind::Saved,
        );
        assert_eq!(first.ordinal(), 1);

        let last =
            ProcessingMode::resolve(TimeScope::Both, true, AiScope::AllMessages, FooterKind::None);
        assert_eq!(last.ordinal(), 36);

        // Footer is the fastest-varying axis.
        let second = ProcessingMode::resolve(
            TimeScope::Historical,
            false,
            AiScope::CaptionsOnly,
            FooterKind::Custom,
        );
        assert_eq!(second.ordinal(), 2);
    }

    #[test]
    fn ordinal_is_stable_across_calls() {
        for mode in all_modes() {
            assert_eq!(mode.ordinal(), mode.ordinal());
        }
    }

    #[test]
    fn policy_derives_scan_flags() {
        let policy = |ts| {
            SessionPolicy::new(
                ProcessingMode::resolve(ts, true, AiScope::CaptionsOnly, FooterKind::None),
                FooterSelection::None,
                None,
            )
            .unwrap()
        };

        let historical = policy(TimeScope::Historical);
        assert!(historical.run_historical());
        assert!(!historical.run_live());

        let live = policy(TimeScope::Live);
        assert!(!live.run_historical());
        assert!(live.run_live());

        let both = policy(TimeScope::Both);
        assert!(both.run_historical());
        assert!(both.run_live());
    }

    #[test]
    fn captions_always_eligible_regardless_of_scope() {
        for ai in [AiScope::CaptionsOnly, AiScope::AllMessages] {
            let policy = SessionPolicy::new(
                ProcessingMode::resolve(TimeScope::Live, false, ai, FooterKind::None),
                FooterSelection::None,
                None,
            )
            .unwrap();
            assert!(policy.ai_applies_to_captions());
            assert_eq!(policy.ai_applies_to_regular_text(), ai == AiScope::AllMessages);
        }
    }

    #[test]
    fn policy_rejects_mismatched_footer_selection() {
        let mode =
            ProcessingMode::resolve(TimeScope::Live, false, AiScope::CaptionsOnly, FooterKind::Saved);
        let result = SessionPolicy::new(mode, FooterSelection::None, None);
        assert!(result.is_err());

        let ok = SessionPolicy::new(mode, FooterSelection::Saved("promo".into()), None);
        assert!(ok.is_ok());
    }

    #[test]
    fn time_scope_parses() {
        assert_eq!("historical".parse::<TimeScope>().unwrap(), TimeScope::Historical);
        assert_eq!("LIVE".parse::<TimeScope>().unwrap(), TimeScope::Live);
        assert_eq!("Both".parse::<TimeScope>().unwrap(), TimeScope::Both);
        assert!("sometimes".parse::<TimeScope>().is_err());
    }

    #[test]
    fn ai_scope_parses() {
        assert_eq!("captions".parse::<AiScope>().unwrap(), AiScope::CaptionsOnly);
        assert_eq!("all".parse::<AiScope>().unwrap(), AiScope::AllMessages);
        assert!("some".parse::<AiScope>().is_err());
    }

    #[test]
    fn footer_selection_parses() {
        assert_eq!(FooterSelection::parse("none").unwrap(), FooterSelection::None);
        assert_eq!(
            FooterSelection::parse("saved:promo").unwrap(),
            FooterSelection::Saved("promo".into())
        );
        assert_eq!(
            FooterSelection::parse("custom:Join t.me/x").unwrap(),
            FooterSelection::Custom("Join t.me/x".into())
        );
        assert!(FooterSelection::parse("saved:").is_err());
        assert!(FooterSelection::parse("garbage").is_err());
    }

    #[test]
    fn mode_display_includes_ordinal() {
        let mode =
            ProcessingMode::resolve(TimeScope::Both, true, AiScope::AllMessages, FooterKind::None);
        let rendered = mode.to_string();
        assert!(rendered.contains("36/36"));
        assert!(rendered.contains("historical+live"));
    }
}
