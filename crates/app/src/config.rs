use shared::settings::AssistantSettings;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `~/.config/sidekick/settings.json` on Linux
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push("sidekick");
        p.push("settings.json");
        p
    })
}

/// Load settings from disk or return defaults. The flag is true when the
/// defaults were used.
pub fn load_settings_or_default() -> (AssistantSettings, bool) {
    match config_path() {
        Some(path) => load_from(&path),
        None => {
            warn!("no config directory on this platform, using default settings");
            (AssistantSettings::default(), true)
        }
    }
}

pub fn load_from(path: &Path) -> (AssistantSettings, bool) {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no settings file, using defaults");
            return (AssistantSettings::default(), true);
        }
        Err(e) => {
            warn!(path = %path.display(), "could not read settings, using defaults: {}", e);
            return (AssistantSettings::default(), true);
        }
    };
    match serde_json::from_str::<AssistantSettings>(&contents) {
        Ok(settings) => (settings, false),
        Err(e) => {
            warn!(path = %path.display(), "malformed settings, using defaults: {}", e);
            (AssistantSettings::default(), true)
        }
    }
}

/// Command line beats `SIDEKICK_DATA_DIR`, which beats the settings file
pub fn resolve_data_dir(flag: Option<PathBuf>, settings: &AssistantSettings) -> PathBuf {
    flag.or_else(|| std::env::var_os("SIDEKICK_DATA_DIR").map(PathBuf::from))
        .or_else(|| settings.data_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(store::default_data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ProviderKind, ProviderPreference};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let (settings, defaulted) = load_from(&dir.path().join("settings.json"));
        assert!(defaulted);
        assert_eq!(settings.history_window, AssistantSettings::default().history_window);
    }

    #[test]
    fn test_reads_partial_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"providers":{"preference":"bundled"},"history_window":4}"#).unwrap();

        let (settings, defaulted) = load_from(&path);
        assert!(!defaulted);
        assert_eq!(settings.history_window, 4);
        assert_eq!(
            settings.providers.preference,
            ProviderPreference::Fixed(ProviderKind::Bundled)
        );
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(load_from(&path).1);
    }

    #[test]
    fn test_flag_wins_for_data_dir() {
        let settings = AssistantSettings {
            data_dir: Some("/from/settings".into()),
            ..Default::default()
        };
        let dir = resolve_data_dir(Some(PathBuf::from("/from/flag")), &settings);
        assert_eq!(dir, PathBuf::from("/from/flag"));
    }
}
