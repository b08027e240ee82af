//! Provider identity, initialization progress and stream status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The inference backends this assistant knows how to drive.
///
/// Declaration order is the registry order, and therefore the tie-break
/// when several backends are usable and the user has no preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Ollama,
    LocalServer,
    Bundled,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Ollama,
        ProviderKind::LocalServer,
        ProviderKind::Bundled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::LocalServer => "local-server",
            ProviderKind::Bundled => "bundled",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "Ollama",
            ProviderKind::LocalServer => "Local server",
            ProviderKind::Bundled => "Bundled model",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("Unknown provider: {}", s))
    }
}

/// Provider selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderPreference {
    #[default]
    Auto,
    Fixed(ProviderKind),
}

impl TryFrom<String> for ProviderPreference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderPreference> for String {
    fn from(value: ProviderPreference) -> Self {
        value.to_string()
    }
}

impl FromStr for ProviderPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(ProviderPreference::Auto)
        } else {
            s.parse().map(ProviderPreference::Fixed)
        }
    }
}

impl fmt::Display for ProviderPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderPreference::Auto => f.write_str("auto"),
            ProviderPreference::Fixed(kind) => kind.fmt(f),
        }
    }
}

/// Initialization phases, in the only order they may occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Downloading,
    Extracting,
    Complete,
}

/// Progress update for a provider that is getting ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleProgress {
    pub provider: ProviderKind,
    pub phase: LifecyclePhase,
    /// 0-100, only meaningful while downloading
    pub percent: u8,
    pub message: String,
}

impl LifecycleProgress {
    pub fn downloading(provider: ProviderKind, percent: u8, message: impl Into<String>) -> Self {
        Self {
            provider,
            phase: LifecyclePhase::Downloading,
            percent: percent.min(100),
            message: message.into(),
        }
    }

    pub fn extracting(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            phase: LifecyclePhase::Extracting,
            percent: 100,
            message: message.into(),
        }
    }

    pub fn complete(provider: ProviderKind) -> Self {
        Self {
            provider,
            phase: LifecyclePhase::Complete,
            percent: 100,
            message: format!("{} is ready", provider.display_name()),
        }
    }
}

/// Where a streaming episode currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    /// Resolving which provider to use
    Preparing,
    /// Waiting for the provider's assets
    Initializing,
    Streaming,
    Completed,
    Failed,
}

impl StreamStatus {
    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamStatus::Streaming)
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            StreamStatus::Preparing | StreamStatus::Initializing | StreamStatus::Streaming
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_round_trip_as_string() {
        let auto: ProviderPreference = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, ProviderPreference::Auto);

        let fixed: ProviderPreference = serde_json::from_str("\"local-server\"").unwrap();
        assert_eq!(fixed, ProviderPreference::Fixed(ProviderKind::LocalServer));
        assert_eq!(serde_json::to_string(&fixed).unwrap(), "\"local-server\"");

        assert!(serde_json::from_str::<ProviderPreference>("\"cloud\"").is_err());
    }

    #[test]
    fn test_phase_order() {
        assert!(LifecyclePhase::Downloading < LifecyclePhase::Extracting);
        assert!(LifecyclePhase::Extracting < LifecyclePhase::Complete);
    }

    #[test]
    fn test_declared_order() {
        let mut kinds = vec![ProviderKind::Bundled, ProviderKind::Ollama, ProviderKind::LocalServer];
        kinds.sort();
        assert_eq!(kinds, ProviderKind::ALL.to_vec());
    }

    #[test]
    fn test_downloading_percent_is_clamped() {
        let p = LifecycleProgress::downloading(ProviderKind::Bundled, 140, "x");
        assert_eq!(p.percent, 100);
    }
}
