use crate::error::CliError;
use libucp::{ConfigMap, ProgressMode};
use log::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The contents of a settings file.
///
/// ```yaml
/// progress_mode: notification
/// options:
///   UCP_EAGER_LIMIT: 16k
/// ```
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub progress_mode: ProgressMode,
    #[serde(default)]
    pub options: ConfigMap,
}

impl Settings {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CliError> {
        save_settings_file(path, self)
    }
}

pub fn default_settings_path() -> PathBuf {
    let mut home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.push(".ucp");
    home.push("settings.yml");
    home
}

pub fn load_settings_file<P: AsRef<Path>>(path: P) -> Result<Settings, CliError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let settings = serde_yml::from_reader(reader)?;
    Ok(settings)
}

/// Loads the settings at `path` (or the default path), falling back to defaults if there is no such file.
pub fn load_or_default(path: Option<&PathBuf>) -> Result<Settings, CliError> {
    let path = path.cloned().unwrap_or_else(default_settings_path);
    match load_settings_file(&path) {
        Ok(settings) => {
            debug!("Settings loaded from {}", path.display());
            Ok(settings)
        }
        Err(CliError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("No settings file at {}. Using defaults.", path.display());
            Ok(Settings::default())
        }
        Err(err) => Err(err),
    }
}

pub fn save_settings_file<P: AsRef<Path>>(path: P, settings: &Settings) -> Result<(), CliError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_yml::to_writer(writer, settings)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn settings_round_trip_through_a_file() {
        let dir = std::env::temp_dir().join(format!("ucp-settings-{}", std::process::id()));
        let path = dir.join("settings.yml");
        let mut settings = Settings { progress_mode: ProgressMode::Polling, ..Default::default() };
        settings.options.insert("UCP_EAGER_LIMIT".into(), "16k".into());
        settings.save(&path).unwrap();
        let loaded = load_or_default(Some(&path)).unwrap();
        assert_eq!(loaded, settings);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_file_means_defaults() {
        let path = std::env::temp_dir().join("ucp-no-such-dir").join("settings.yml");
        assert_eq!(load_or_default(Some(&path)).unwrap(), Settings::default());
    }

    #[test]
    fn partial_file_is_accepted() {
        let settings: Settings = serde_yml::from_str("progress_mode: manual\n").unwrap();
        assert_eq!(settings.progress_mode, ProgressMode::Manual);
        assert!(settings.options.is_empty());
        assert!(serde_yml::from_str::<Settings>("progress_mode: sometimes\n").is_err());
    }
}
