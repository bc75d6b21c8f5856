use std::path::{Path, PathBuf};
use std::time::Duration;

use anuja_imagine::{DEFAULT_ENDPOINT, DEFAULT_IMAGE_SIZE, ImageEndpoint};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::DEFAULT_REPLY_DELAY;

pub const SETTINGS_DIRECTORY_NAME: &str = "anuja";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "ANUJA_";
pub const DATABASE_FILE_NAME: &str = "anuja.sqlite3";
pub const IN_MEMORY_DATABASE: &str = ":memory:";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSettings {
    #[serde(default = "default_image_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_image_size")]
    pub width: u32,
    #[serde(default = "default_image_size")]
    pub height: u32,
    #[serde(default = "default_nologo")]
    pub nologo: bool,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            endpoint: default_image_endpoint(),
            width: DEFAULT_IMAGE_SIZE,
            height: DEFAULT_IMAGE_SIZE,
            nologo: true,
        }
    }
}

impl ImageSettings {
    pub fn to_endpoint(&self) -> ImageEndpoint {
        ImageEndpoint::new(self.endpoint.clone(), self.width, self.height, self.nologo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_reply_delay_ms")]
    pub reply_delay_ms: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            reply_delay_ms: default_reply_delay_ms(),
        }
    }
}

impl ChatSettings {
    pub fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.reply_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// SQLite file path, `sqlite:` URL, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub image: ImageSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database: default_database(),
            image: ImageSettings::default(),
            chat: ChatSettings::default(),
            download_dir: None,
            log_filter: default_log_filter(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.database = if self.database.trim().is_empty() {
            default_database()
        } else {
            self.database.trim().to_string()
        };
        self.image = self.image.to_endpoint().into();
        self.download_dir = self
            .download_dir
            .filter(|path| !path.as_os_str().is_empty());
        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };
        self
    }

    /// Where downloaded images go when no directory is configured.
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl From<ImageEndpoint> for ImageSettings {
    fn from(endpoint: ImageEndpoint) -> Self {
        Self {
            endpoint: endpoint.base_url,
            width: endpoint.width,
            height: endpoint.height,
            nologo: endpoint.nologo,
        }
    }
}

pub struct SettingsStore {
    settings: AppSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".anuja"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path);
        Self {
            settings,
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&mut self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings = normalized_settings;
        Ok(())
    }

    // defaults <- settings file <- ANUJA_* environment
    fn load_layers(path: &Path) -> AppSettings {
        let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database() -> String {
    dirs::data_local_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DATABASE_FILE_NAME))
        .to_string_lossy()
        .into_owned()
}

fn default_image_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_image_size() -> u32 {
    DEFAULT_IMAGE_SIZE
}

fn default_nologo() -> bool {
    true
}

fn default_reply_delay_ms() -> u64 {
    DEFAULT_REPLY_DELAY.as_millis() as u64
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join("absent.json"));
            assert_eq!(store.settings(), &AppSettings::default());
            assert_eq!(store.settings().chat.reply_delay(), DEFAULT_REPLY_DELAY);
            Ok(())
        });
    }

    #[test]
    fn file_then_environment_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "database": ":memory:",
                    "image": { "endpoint": "http://localhost:9000/", "width": 0 },
                    "chat": { "reply_delay_ms": 250 }
                }"#,
            )?;
            jail.set_env("ANUJA_CHAT__REPLY_DELAY_MS", "5");
            jail.set_env("ANUJA_LOG_FILTER", "debug");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.database, IN_MEMORY_DATABASE);
            assert_eq!(settings.image.endpoint, "http://localhost:9000");
            assert_eq!(settings.image.width, DEFAULT_IMAGE_SIZE);
            assert_eq!(settings.chat.reply_delay_ms, 5);
            assert_eq!(settings.log_filter, "debug");
            Ok(())
        });
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{ "chat": { "reply_delay_ms": "soon" } }"#)?;
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(store.settings().chat, ChatSettings::default());
            Ok(())
        });
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let mut store = SettingsStore::new(path.clone());

        let mut settings = AppSettings::default();
        settings.database = "  ".to_string();
        settings.log_filter = " warn ".to_string();
        store.update(settings).expect("persist");

        let written = std::fs::read_to_string(&path).expect("settings written");
        let parsed: AppSettings = serde_json::from_str(&written).expect("valid json");
        assert_eq!(parsed.log_filter, "warn");
        assert_eq!(parsed.database, default_database());
        assert_eq!(store.settings(), &parsed);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
