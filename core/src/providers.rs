//! Provider CLIs the supervisor can drive.
//!
//! A provider is a value, not a trait object: the capability set is small
//! and closed, so a tagged enum plus a name registry keeps dispatch flat.
//! Unknown provider names resolve to `None` rather than failing
//! construction; callers surface that as `ProviderUnavailable`.

use std::path::Path;
use steroids_state::InvocationRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Gemini,
    Openai,
    Codex,
    Mistral,
}

pub const ALL_PROVIDERS: [ProviderKind; 5] = [
    ProviderKind::Claude,
    ProviderKind::Gemini,
    ProviderKind::Openai,
    ProviderKind::Codex,
    ProviderKind::Mistral,
];

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "openai" => Some(Self::Openai),
            "codex" => Some(Self::Codex),
            "mistral" => Some(Self::Mistral),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Openai => "openai",
            ProviderKind::Codex => "codex",
            ProviderKind::Mistral => "mistral",
        }
    }

    pub const fn cli_binary(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Openai => "openai",
            ProviderKind::Codex => "codex",
            ProviderKind::Mistral => "mistral",
        }
    }

    pub fn is_available(self) -> bool {
        which::which(self.cli_binary()).is_ok()
    }

    pub const fn default_model(self, role: InvocationRole) -> &'static str {
        match (self, role) {
            (ProviderKind::Claude, InvocationRole::Reviewer) => "claude-sonnet-4-5",
            (ProviderKind::Claude, _) => "claude-opus-4-5",
            (ProviderKind::Gemini, _) => "gemini-2.5-pro",
            (ProviderKind::Openai, InvocationRole::Reviewer) => "gpt-5-mini",
            (ProviderKind::Openai, _) => "gpt-5",
            (ProviderKind::Codex, _) => "gpt-5-codex",
            (ProviderKind::Mistral, _) => "devstral-medium",
        }
    }

    pub const fn list_models(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Claude => &["claude-opus-4-5", "claude-sonnet-4-5", "claude-haiku-4-5"],
            ProviderKind::Gemini => &["gemini-2.5-pro", "gemini-2.5-flash"],
            ProviderKind::Openai => &["gpt-5", "gpt-5-mini"],
            ProviderKind::Codex => &["gpt-5-codex"],
            ProviderKind::Mistral => &["devstral-medium", "mistral-large-latest"],
        }
    }

    /// Whether this CLI emits line-delimited JSON events on stdout.
    pub const fn speaks_stream_json(self) -> bool {
        matches!(self, ProviderKind::Claude | ProviderKind::Codex)
    }

    /// Default argv-array invocation: prompt path plus model selector,
    /// never a shell.
    pub fn build_argv(self, model: &str, prompt_path: &Path) -> Vec<String> {
        let prompt = prompt_path.display().to_string();
        match self {
            ProviderKind::Claude => vec![
                "--model".to_string(),
                model.to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--prompt-file".to_string(),
                prompt,
            ],
            ProviderKind::Gemini => vec!["--model".to_string(), model.to_string(), prompt],
            ProviderKind::Openai => vec!["--model".to_string(), model.to_string(), prompt],
            ProviderKind::Codex => vec![
                "exec".to_string(),
                "--model".to_string(),
                model.to_string(),
                "--json".to_string(),
                "--prompt-file".to_string(),
                prompt,
            ],
            ProviderKind::Mistral => vec!["--model".to_string(), model.to_string(), prompt],
        }
    }

    /// Classify a finished invocation from its exit code and stderr.
    pub fn classify(self, exit_code: i64, stderr: &str) -> Classification {
        if exit_code == 0 {
            return Classification {
                kind: FailureKind::Unknown,
                retryable: false,
                message: String::new(),
            };
        }
        let haystack = stderr.to_lowercase();
        let (kind, retryable) = if CREDIT_CUES.iter().any(|cue| haystack.contains(cue)) {
            (FailureKind::CreditExhaustion, false)
        } else if MODEL_CUES.iter().any(|cue| haystack.contains(cue)) {
            (FailureKind::ModelNotFound, false)
        } else if AUTH_CUES.iter().any(|cue| haystack.contains(cue)) {
            (FailureKind::AuthError, false)
        } else if NETWORK_CUES.iter().any(|cue| haystack.contains(cue)) {
            (FailureKind::Network, true)
        } else {
            (FailureKind::Unknown, false)
        };
        let message = stderr.lines().next().unwrap_or("").trim().to_string();
        Classification {
            kind,
            retryable,
            message,
        }
    }
}

const CREDIT_CUES: [&str; 6] = [
    "credit balance",
    "insufficient credits",
    "insufficient_quota",
    "quota exceeded",
    "billing",
    "payment required",
];

const MODEL_CUES: [&str; 3] = ["model not found", "unknown model", "no such model"];

const AUTH_CUES: [&str; 5] = [
    "unauthorized",
    "invalid api key",
    "authentication",
    "401",
    "403",
];

const NETWORK_CUES: [&str; 6] = [
    "connection refused",
    "econnrefused",
    "enotfound",
    "etimedout",
    "dns",
    "network error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CreditExhaustion,
    ModelNotFound,
    AuthError,
    Network,
    Unknown,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FailureKind::CreditExhaustion => "credit_exhaustion",
            FailureKind::ModelNotFound => "model_not_found",
            FailureKind::AuthError => "auth_error",
            FailureKind::Network => "network",
            FailureKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unknown_names_do_not_resolve() {
        assert_eq!(ProviderKind::from_name("claude"), Some(ProviderKind::Claude));
        assert_eq!(ProviderKind::from_name("copilot"), None);
    }

    #[test]
    fn credit_exhaustion_is_detected_from_stderr() {
        let classification = ProviderKind::Claude.classify(
            1,
            "Error: Your credit balance is too low to run this request.",
        );
        assert_eq!(classification.kind, FailureKind::CreditExhaustion);
        assert!(!classification.retryable);
    }

    #[test]
    fn network_failures_are_retryable() {
        let classification =
            ProviderKind::Gemini.classify(1, "fetch failed: ECONNREFUSED 10.0.0.1:443");
        assert_eq!(classification.kind, FailureKind::Network);
        assert!(classification.retryable);
    }

    #[test]
    fn clean_exit_is_not_classified() {
        let classification = ProviderKind::Openai.classify(0, "");
        assert_eq!(classification.kind, FailureKind::Unknown);
        assert!(classification.message.is_empty());
    }

    #[test]
    fn every_provider_has_a_model_per_role() {
        for provider in ALL_PROVIDERS {
            for role in [
                InvocationRole::Coder,
                InvocationRole::Reviewer,
                InvocationRole::Orchestrator,
            ] {
                assert!(!provider.default_model(role).is_empty());
                assert!(
                    provider
                        .list_models()
                        .contains(&provider.default_model(role))
                );
            }
        }
    }
}
