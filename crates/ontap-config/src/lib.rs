//! Shared configuration for ONTAP tools.
//!
//! TOML profiles, password resolution (env + keyring + plaintext), and
//! translation to `ontap_core::ConnectionArgs`. Connection options are
//! layered as plain maps so a task file can still override any of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use ontap_core::{ConnectionArgs, UseRest};

/// Keyring service name for stored passwords.
pub const KEYRING_SERVICE: &str = "ontapctl";

/// Environment variable consulted when a profile names none of its own.
pub const PASSWORD_ENV: &str = "ONTAP_PASSWORD";

const MASK: &str = "********";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no password configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("profile '{profile}' not found in {}", path.display())]
    UnknownProfile { profile: String, path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named cluster profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub use_rest: UseRest,

    #[serde(default = "default_true")]
    pub validate_certs: bool,

    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_poll_interval")]
    pub job_poll_interval: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            use_rest: UseRest::Auto,
            validate_certs: true,
            timeout: default_timeout(),
            job_poll_interval: default_poll_interval(),
        }
    }
}

fn default_output() -> String {
    "json".into()
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    1
}

/// A named cluster profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Cluster management LIF hostname or IP.
    pub hostname: String,

    pub username: Option<String>,

    /// Plaintext password. Prefer the keyring or `password_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_certs: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_rest: Option<UseRest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
}

impl Config {
    /// Pick `name`, else the default profile. `None` when the config has
    /// no matching profile and none was asked for explicitly.
    pub fn profile(&self, name: Option<&str>) -> Result<Option<(String, &Profile)>, ConfigError> {
        if let Some(name) = name {
            return self
                .profiles
                .get(name)
                .map(|p| Some((name.to_owned(), p)))
                .ok_or_else(|| ConfigError::UnknownProfile {
                    profile: name.to_owned(),
                    path: config_path(),
                });
        }
        Ok(self
            .default_profile
            .as_deref()
            .and_then(|name| self.profiles.get(name).map(|p| (name.to_owned(), p))))
    }

    /// Copy with every plaintext password masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        for profile in out.profiles.values_mut() {
            if profile.password.is_some() {
                profile.password = Some(MASK.into());
            }
        }
        out
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "ontapctl", "ontapctl").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("ontapctl");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Defaults, then `path`, then `ONTAP_`-prefixed variables
/// (`ONTAP_DEFAULTS__TIMEOUT=120`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ONTAP_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file is missing or unreadable.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/password"))
        .map_err(|e| ConfigError::Keyring(e.to_string()))
}

/// Resolve a profile's password.
///
/// Order: the profile's `password_env`, `ONTAP_PASSWORD`, the system
/// keyring, then the plaintext profile value.
pub fn resolve_password(
    profile: &Profile,
    profile_name: &str,
) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Ok(val) = std::env::var(PASSWORD_ENV) {
        return Ok(SecretString::from(val));
    }

    if let Ok(entry) = keyring_entry(profile_name) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    if let Some(ref pw) = profile.password {
        return Ok(SecretString::from(pw.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Store a profile password in the system keyring.
pub fn store_password(profile_name: &str, password: &SecretString) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?
        .set_password(password.expose_secret())
        .map_err(|e| ConfigError::Keyring(e.to_string()))
}

// ── Connection layering ─────────────────────────────────────────────

/// Connection options from the defaults table and, when given, a
/// profile. Passwords are never part of the map.
pub fn connection_layer(defaults: &Defaults, profile: Option<&Profile>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("use_rest".into(), Value::String(defaults.use_rest.to_string()));
    map.insert("validate_certs".into(), Value::Bool(defaults.validate_certs));
    map.insert("timeout".into(), Value::from(defaults.timeout));
    map.insert("job_poll_interval".into(), Value::from(defaults.job_poll_interval));

    let Some(profile) = profile else {
        return map;
    };
    map.insert("hostname".into(), Value::String(profile.hostname.clone()));
    if let Some(username) = &profile.username {
        map.insert("username".into(), Value::String(username.clone()));
    }
    if let Some(https) = profile.https {
        map.insert("https".into(), Value::Bool(https));
    }
    if let Some(validate) = profile.validate_certs {
        map.insert("validate_certs".into(), Value::Bool(validate));
    }
    if let Some(port) = profile.http_port {
        map.insert("http_port".into(), Value::from(port));
    }
    if let Some(use_rest) = profile.use_rest {
        map.insert("use_rest".into(), Value::String(use_rest.to_string()));
    }
    if let Some(ca) = &profile.ca_cert {
        map.insert("ca_cert".into(), Value::String(ca.display().to_string()));
    }
    map
}

/// Overlay `top` onto `base`, key by key. Nulls in `top` are skipped.
pub fn overlay(mut base: Map<String, Value>, top: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in top {
        if !value.is_null() {
            base.insert(key, value);
        }
    }
    base
}

/// Build engine connection arguments from a merged layer.
///
/// `password` is used only when the layer does not carry one itself.
pub fn connection_args(
    mut layer: Map<String, Value>,
    password: Option<&SecretString>,
) -> Result<ConnectionArgs, ConfigError> {
    for required in ["hostname", "username"] {
        if layer.get(required).is_none_or(Value::is_null) {
            return Err(ConfigError::Validation {
                field: required.into(),
                reason: "not set in the task, on the command line, or in the profile".into(),
            });
        }
    }
    if !layer.contains_key("password") {
        let password = password.ok_or_else(|| ConfigError::Validation {
            field: "password".into(),
            reason: format!("not set; use a profile, the keyring, or {PASSWORD_ENV}"),
        })?;
        layer.insert("password".into(), Value::String(password.expose_secret().to_owned()));
    }
    ConnectionArgs::from_map(layer).map_err(|e| ConfigError::Validation {
        field: "connection".into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    const SAMPLE: &str = r#"
default_profile = "lab"

[defaults]
output = "yaml"
timeout = 90

[profiles.lab]
hostname = "cluster1.lab"
username = "admin"
password = "netapp1!"
use_rest = "never"
validate_certs = false
"#;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_profiles_over_defaults() {
        let file = write_config(SAMPLE);
        let cfg = load_config_from(file.path()).unwrap();
        assert_eq!(cfg.defaults.output, "yaml");
        assert_eq!(cfg.defaults.timeout, 90);
        assert_eq!(cfg.defaults.job_poll_interval, 1);

        let (name, profile) = cfg.profile(None).unwrap().unwrap();
        assert_eq!(name, "lab");
        assert_eq!(profile.use_rest, Some(UseRest::Never));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.default_profile.as_deref(), Some("default"));
        assert!(cfg.profiles.is_empty());
        assert!(cfg.profile(None).unwrap().is_none());
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.profile(Some("prod")),
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn redaction_masks_passwords() {
        let file = write_config(SAMPLE);
        let cfg = load_config_from(file.path()).unwrap().redacted();
        assert_eq!(cfg.profiles["lab"].password.as_deref(), Some(MASK));
        assert_eq!(cfg.profiles["lab"].hostname, "cluster1.lab");
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let file = write_config(SAMPLE);
        let cfg = load_config_from(file.path()).unwrap();
        save_config_to(&cfg, &path).unwrap();
        let again = load_config_from(&path).unwrap();
        assert_eq!(again.profiles["lab"].username.as_deref(), Some("admin"));
    }

    #[test]
    fn task_values_win_over_profile() {
        let file = write_config(SAMPLE);
        let cfg = load_config_from(file.path()).unwrap();
        let (_, profile) = cfg.profile(None).unwrap().unwrap();
        let base = connection_layer(&cfg.defaults, Some(profile));
        assert_eq!(base["use_rest"], json!("never"));
        assert_eq!(base["timeout"], json!(90));

        let task = json!({"use_rest": "always", "http_port": null});
        let merged = overlay(base, task.as_object().unwrap().clone());
        let args = connection_args(merged, Some(&SecretString::from("pw".to_owned()))).unwrap();
        assert_eq!(args.hostname, "cluster1.lab");
        assert_eq!(args.use_rest, UseRest::Always);
        assert!(!args.validate_certs);
        assert_eq!(args.http_port, None);
        assert_eq!(args.password.expose_secret(), "pw");
    }

    #[test]
    fn explicit_password_in_layer_is_kept() {
        let layer = json!({"hostname": "c1", "username": "admin", "password": "inline"});
        let args = connection_args(layer.as_object().unwrap().clone(), None).unwrap();
        assert_eq!(args.password.expose_secret(), "inline");
    }

    #[test]
    fn hostname_is_required() {
        let layer = connection_layer(&Defaults::default(), None);
        let err = connection_args(layer, None).unwrap_err();
        assert!(err.to_string().contains("hostname"));
    }

    #[test]
    fn plaintext_password_is_the_last_resort() {
        let profile = Profile {
            hostname: "c1".into(),
            password: Some("plain".into()),
            password_env: Some("ONTAPCTL_TEST_UNSET_PASSWORD_VAR".into()),
            ..Profile::default()
        };
        if std::env::var(PASSWORD_ENV).is_err() {
            let pw = resolve_password(&profile, "ontapctl-test-no-such-profile").unwrap();
            assert_eq!(pw.expose_secret(), "plain");
        }
    }
}
