//! Configuration.
//!
//! [`Settings`] holds runtime knobs (database, worker pool, thresholds). A
//! [`SettingsFile`] found by `prefer` (or named with `--config`) is laid over
//! the defaults, then environment overrides apply. [`ImporterConfig`]
//! describes one import run; it is validated before anything is queued and
//! stored as JSON on the ingest operation so every worker sees the same
//! configuration.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::deid::{self, DeidProfileConfig};
use crate::models::{ContainerType, ItemContext, SubjectCodeFormat};
use crate::template::{Template, TemplateNodeConfig};
use crate::walker::WalkFilters;

/// Profile used when de-identification is requested without naming one.
pub const DEFAULT_DEID_PROFILE: &str = "minimal";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to parse {path}: {message}")]
    ParseFile { path: PathBuf, message: String },

    #[error("Failed to parse template file: {0}")]
    TemplateFile(#[from] serde_yaml::Error),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Conflicting options: {0}")]
    Conflict(String),

    #[error("Unknown de-identification profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `sqlite:<path>` or `postgres:<dsn>`.
    pub database_url: String,
    /// Local worker count for `run` and `worker`.
    pub workers: usize,
    /// Sleep between polls when every queue is empty.
    pub poll_interval_ms: u64,
    /// Copy buffer size for streaming reads.
    pub buffer_size: usize,
    /// Packfile archives stay in memory up to this many bytes.
    pub spool_threshold: usize,
    /// Payloads at or below this size are uploaded as one buffer.
    pub in_memory_upload_threshold: u64,
    /// Claims older than this are considered abandoned.
    pub lease_timeout_secs: u64,
    /// Root directory of the local upload destination.
    pub destination: PathBuf,
    /// Skip the confirmation prompt before uploading.
    pub assume_yes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:bulk-import.db".to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            poll_interval_ms: 1000,
            buffer_size: 64 * 1024,
            spool_threshold: 64 * 1024 * 1024,
            in_memory_upload_threshold: 16 * 1024 * 1024,
            lease_timeout_secs: 90 * 60,
            destination: PathBuf::from("uploads"),
            assume_yes: false,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the `bulk-import` config file
    /// discovered in the standard locations, then apply environment
    /// overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some(SettingsFile::load_from_path(&expand_path(path)).await?),
            None => SettingsFile::discover().await?,
        };

        let mut settings = Self::default();
        if let Some(file) = file {
            file.apply_to(&mut settings)?;
        }
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = toml::from_str(text)?;
        let mut settings = Self::default();
        file.apply_to(&mut settings)?;
        Ok(settings)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("BULK_IMPORT_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(workers) = env::var("BULK_IMPORT_WORKERS") {
            self.workers = workers.parse().map_err(|e| ConfigError::Invalid {
                key: "BULK_IMPORT_WORKERS",
                message: format!("{e}"),
            })?;
        }
        if let Ok(dest) = env::var("BULK_IMPORT_DESTINATION") {
            self.destination = expand_path(Path::new(&dest));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Missing("database_url"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "poll_interval_ms",
                message: "must be positive".to_string(),
            });
        }
        if self.lease_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "lease_timeout_secs",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

/// Settings as written in a config file. Unset keys keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, prefer::FromValue)]
pub struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spool_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_memory_upload_threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_yes: Option<bool>,
    /// File this was read from.
    #[serde(skip)]
    #[prefer(skip)]
    pub source_path: Option<PathBuf>,
}

impl SettingsFile {
    /// Find a `bulk-import` config file in the standard locations.
    pub async fn discover() -> Result<Option<Self>, ConfigError> {
        match prefer::load("bulk-import").await {
            Ok(found) => match found.source_path() {
                Some(path) => Self::load_from_path(path).await.map(Some),
                None => Ok(None),
            },
            Err(e) => {
                debug!("No config file found: {}", e);
                Ok(None)
            }
        }
    }

    /// Read a config file. The format follows the extension: TOML, YAML, or
    /// JSON otherwise.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading settings from {}", path.display());
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let parsed: Result<Self, String> = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
            "json" => serde_json::from_str(&contents).map_err(|e| e.to_string()),
            _ => toml::from_str(&contents).map_err(|e| e.to_string()),
        };
        let mut file = parsed.map_err(|message| ConfigError::ParseFile {
            path: path.to_path_buf(),
            message,
        })?;
        file.source_path = Some(path.to_path_buf());
        Ok(file)
    }

    pub fn apply_to(&self, settings: &mut Settings) -> Result<(), ConfigError> {
        if let Some(ref url) = self.database_url {
            settings.database_url = url.clone();
        }
        if let Some(workers) = self.workers {
            settings.workers = to_usize("workers", workers)?;
        }
        if let Some(ms) = self.poll_interval_ms {
            settings.poll_interval_ms = ms;
        }
        if let Some(size) = self.buffer_size {
            settings.buffer_size = to_usize("buffer_size", size)?;
        }
        if let Some(size) = self.spool_threshold {
            settings.spool_threshold = to_usize("spool_threshold", size)?;
        }
        if let Some(size) = self.in_memory_upload_threshold {
            settings.in_memory_upload_threshold = size;
        }
        if let Some(secs) = self.lease_timeout_secs {
            settings.lease_timeout_secs = secs;
        }
        if let Some(ref dest) = self.destination {
            settings.destination = expand_path(Path::new(dest));
        }
        if let Some(yes) = self.assume_yes {
            settings.assume_yes = yes;
        }
        Ok(())
    }
}

fn to_usize(key: &'static str, value: u64) -> Result<usize, ConfigError> {
    usize::try_from(value).map_err(|e| ConfigError::Invalid {
        key,
        message: e.to_string(),
    })
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => path.to_path_buf(),
    }
}

/// Configuration of one import run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Source folder or zip archive.
    pub folder: PathBuf,
    /// Fixed destination labels applied above the template.
    pub group: Option<String>,
    pub project: Option<String>,
    /// Template levels, outermost first.
    pub template: Vec<TemplateNodeConfig>,
    /// De-identify with the default profile.
    pub de_identify: bool,
    /// De-identify with a named profile. Mutually exclusive with `de_identify`.
    pub deid_profile: Option<String>,
    /// Profiles defined inline, looked up before the built-in ones.
    pub deid_profiles: Vec<DeidProfileConfig>,
    /// File name globs to include (all files when empty).
    pub include: Vec<String>,
    /// File name globs to skip.
    pub exclude: Vec<String>,
    /// Directory name globs to skip entirely.
    pub exclude_dirs: Vec<String>,
    pub follow_symlinks: bool,
    /// Private tag dictionary CSV registered for this ingest.
    pub private_tags: Option<PathBuf>,
    pub no_audit_log: bool,
    pub audit_log_path: Option<PathBuf>,
}

impl ImporterConfig {
    pub fn for_folder(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// Check the configuration before anything is queued.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.folder.as_os_str().is_empty() {
            return Err(ConfigError::Missing("folder"));
        }
        if self.de_identify && self.deid_profile.is_some() {
            return Err(ConfigError::Conflict(
                "--de-identify and --profile cannot be combined; --profile already enables de-identification"
                    .to_string(),
            ));
        }

        Template::from_config(&self.template)
            .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;
        self.walk_filters()?;

        if let Some(name) = self.deid_profile_name() {
            let profile = self
                .deid_profile_config()
                .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))?;
            if let Some(mapping) = &profile.subjects_mapping {
                SubjectCodeFormat::parse(&mapping.format).map_err(|message| {
                    ConfigError::Invalid {
                        key: "subjects_mapping.format",
                        message,
                    }
                })?;
                if mapping.fields.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "subjects_mapping.fields",
                        message: "at least one field is required".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Name of the de-identification profile in effect, if any.
    ///
    /// `de_identify` alone selects [`DEFAULT_DEID_PROFILE`]; a named profile
    /// implies de-identification.
    pub fn deid_profile_name(&self) -> Option<&str> {
        match (&self.deid_profile, self.de_identify) {
            (Some(name), _) => Some(name.as_str()),
            (None, true) => Some(DEFAULT_DEID_PROFILE),
            (None, false) => None,
        }
    }

    pub fn deid_enabled(&self) -> bool {
        self.deid_profile_name().is_some()
    }

    /// Resolved configuration of the active profile.
    pub fn deid_profile_config(&self) -> Option<DeidProfileConfig> {
        self.deid_profile_name()
            .and_then(|name| deid::profile_config(name, &self.deid_profiles))
    }

    /// Context every discovery starts from.
    pub fn root_context(&self) -> ItemContext {
        let mut context = ItemContext::default();
        if let Some(group) = &self.group {
            context.metadata.set(ContainerType::Group, group.clone());
        }
        if let Some(project) = &self.project {
            context.metadata.set(ContainerType::Project, project.clone());
        }
        context
    }

    pub fn walk_filters(&self) -> Result<WalkFilters, ConfigError> {
        WalkFilters::new(&self.include, &self.exclude, &self.exclude_dirs)
            .map(|f| f.follow_symlinks(self.follow_symlinks))
            .map_err(|e| ConfigError::InvalidPattern {
                pattern: e.glob().unwrap_or_default().to_string(),
                message: e.kind().to_string(),
            })
    }

    /// Load template levels from a YAML file.
    pub fn load_template_file(path: &Path) -> Result<Vec<TemplateNodeConfig>, ConfigError> {
        let path = expand_path(path);
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deid_profile_precedence() {
        let mut config = ImporterConfig::for_folder("/data");
        assert_eq!(config.deid_profile_name(), None);
        assert!(config.validate().is_ok());

        config.de_identify = true;
        assert_eq!(config.deid_profile_name(), Some(DEFAULT_DEID_PROFILE));
        assert!(config.validate().is_ok());

        config.deid_profile = Some("minimal".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Conflict(_))));

        config.de_identify = false;
        assert_eq!(config.deid_profile_name(), Some("minimal"));
        assert!(config.validate().is_ok());

        config.deid_profile = Some("nope".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownProfile(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_missing_folder() {
        assert!(matches!(
            ImporterConfig::default().validate(),
            Err(ConfigError::Missing("folder"))
        ));
    }

    #[test]
    fn test_bad_template_rejected() {
        let mut config = ImporterConfig::for_folder("/data");
        config.template = vec![TemplateNodeConfig::pattern("(?P<subject>[")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            database_url = "sqlite:/tmp/import.db"
            workers = 3
            lease_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(settings.database_url, "sqlite:/tmp/import.db");
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.lease_timeout(), Duration::from_secs(60));
        assert_eq!(settings.poll_interval_ms, 1000);
        assert!(settings.validate().is_ok());
    }

    #[tokio::test]
    async fn test_settings_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("bulk-import.yaml");
        fs::write(&yaml, "workers: 5\nassume_yes: true\ndestination: /srv/uploads\n").unwrap();

        let file = SettingsFile::load_from_path(&yaml).await.unwrap();
        assert_eq!(file.source_path.as_deref(), Some(yaml.as_path()));
        let mut settings = Settings::default();
        file.apply_to(&mut settings).unwrap();
        assert_eq!(settings.workers, 5);
        assert!(settings.assume_yes);
        assert_eq!(settings.destination, PathBuf::from("/srv/uploads"));
        assert_eq!(settings.poll_interval_ms, Settings::default().poll_interval_ms);

        let json = dir.path().join("settings.json");
        fs::write(&json, r#"{"lease_timeout_secs": 30}"#).unwrap();
        let file = SettingsFile::load_from_path(&json).await.unwrap();
        assert_eq!(file.lease_timeout_secs, Some(30));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "workers = [").unwrap();
        assert!(matches!(
            SettingsFile::load_from_path(&broken).await,
            Err(ConfigError::ParseFile { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_explicit_path_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "poll_interval_ms = 0\n").unwrap();
        assert!(matches!(
            Settings::load(Some(&path)).await,
            Err(ConfigError::Invalid { key: "poll_interval_ms", .. })
        ));

        fs::write(&path, "poll_interval_ms = 250\nspool_threshold = 4096\n").unwrap();
        let settings = Settings::load(Some(&path)).await.unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.spool_threshold, 4096);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Settings::load(Some(&missing)).await,
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_importer_config_json_round_trip() {
        let mut config = ImporterConfig::for_folder("/data");
        config.project = Some("trial".to_string());
        config.template = vec![TemplateNodeConfig::pattern("{subject}")];

        let json = serde_json::to_string(&config).unwrap();
        let back: ImporterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(
            back.root_context().metadata.project.as_deref(),
            Some("trial")
        );
    }
}
