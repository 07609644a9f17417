use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use shinku_core::{CommandSource, DEFAULT_POLL_INTERVAL, FileSource, SharedConfig, TextSource};
use shinku_llm::{CustomParamError, SessionConfig};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "shinku";
pub const SETTINGS_FILE_NAME: &str = "shinku-config.json";
pub const ENV_PREFIX: &str = "SHINKU_";
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Where monitored text comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceSettings {
    /// The platform clipboard utility.
    #[default]
    Clipboard,
    /// Any program whose stdout is the monitored text.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    File { path: PathBuf },
}

impl SourceSettings {
    pub fn to_text_source(&self) -> Box<dyn TextSource> {
        match self {
            Self::Clipboard => Box::new(CommandSource::clipboard()),
            Self::Command { program, args } => Box::new(CommandSource::new(program, args.clone())),
            Self::File { path } => Box::new(FileSource::new(path)),
        }
    }
}

/// Persisted application settings. Session fields live at the top level of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    #[serde(flatten)]
    pub session: SessionConfig,
    pub source: SourceSettings,
    pub poll_interval_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            source: SourceSettings::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.session = self.session.normalized();
        self.poll_interval_ms = self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Command-line values that win over the file for this run and are never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    pub model_name: Option<String>,
    pub source_file: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
}

impl RuntimeOverrides {
    pub fn apply(&self, mut settings: AppSettings) -> AppSettings {
        if let Some(model_name) = &self.model_name {
            settings.session.model_name = model_name.clone();
        }
        if let Some(path) = &self.source_file {
            settings.source = SourceSettings::File { path: path.clone() };
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            settings.poll_interval_ms = poll_interval_ms;
        }
        settings.normalized()
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
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display("rejected custom parameter on `{stage}`: {source}"))]
    CustomParam {
        stage: &'static str,
        source: CustomParamError,
    },
}

/// Owns the settings file and publishes the effective session config.
///
/// `stored` mirrors the file; the published values additionally carry the
/// runtime overrides.
pub struct SettingsStore {
    stored: ArcSwap<AppSettings>,
    effective: ArcSwap<AppSettings>,
    session: SharedConfig,
    overrides: RuntimeOverrides,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".shinku"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads settings, writing defaults first when the file does not exist yet.
    pub fn open(config_path: PathBuf, overrides: RuntimeOverrides) -> Self {
        if !config_path.exists() {
            tracing::info!(path = ?config_path, "settings file not found, writing defaults");
            if let Err(error) = persist(&config_path, &AppSettings::default()) {
                tracing::warn!(error = %error, "failed to write default settings");
            }
        }

        let stored = match extract(&config_path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(error = %error, "using default settings");
                AppSettings::default()
            }
        };
        let effective = overrides.apply(stored.clone());

        Self {
            session: Arc::new(ArcSwap::from_pointee(effective.session.clone())),
            stored: ArcSwap::from_pointee(stored),
            effective: ArcSwap::from_pointee(effective),
            overrides,
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Effective settings for this run.
    pub fn settings(&self) -> Arc<AppSettings> {
        self.effective.load_full()
    }

    /// Handle the coordinator reads once per turn.
    pub fn session_config(&self) -> SharedConfig {
        self.session.clone()
    }

    /// Persists `settings` and publishes them for the next turn.
    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let settings = settings.normalized();
        persist(&self.config_path, &settings)?;
        self.publish(settings);
        Ok(())
    }

    /// Adds one `key: value` custom parameter line and persists it.
    pub fn apply_custom_param(&self, line: &str) -> Result<Arc<AppSettings>, SettingsError> {
        let mut settings = AppSettings::clone(&self.stored.load());
        settings
            .session
            .custom_params
            .apply_line(line)
            .context(CustomParamSnafu {
                stage: "apply-custom-param",
            })?;
        self.update(settings)?;
        Ok(self.settings())
    }

    /// Re-reads the file. On failure the current settings stay published.
    pub fn reload(&self) -> Result<Arc<AppSettings>, SettingsError> {
        let settings = extract(&self.config_path)?;
        self.publish(settings);
        Ok(self.settings())
    }

    fn publish(&self, stored: AppSettings) {
        let effective = self.overrides.apply(stored.clone());
        self.session.store(Arc::new(effective.session.clone()));
        self.effective.store(Arc::new(effective));
        self.stored.store(Arc::new(stored));
    }
}

fn extract(path: &Path) -> Result<AppSettings, SettingsError> {
    let settings = Figment::from(Serialized::defaults(AppSettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract::<AppSettings>()
        .context(ExtractSnafu {
            stage: "extract-settings",
            path: path.to_path_buf(),
        })?;
    Ok(settings.normalized())
}

fn persist(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
        stage: "serialize-settings-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-settings-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-settings-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;

    tracing::info!(path = ?path, "saved settings");
    Ok(())
}
