//! Process-level configuration, read from the host preference domain
//! `mil.navy.nrl.cmf.pkcs11`.
//!
//! Preference lookup itself is a host concern behind the [`Preferences`]
//! trait; the key semantics (program-basename matching and the
//! `all`/`none` sentinels) live here so they can be tested without a
//! platform.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, warn};

pub const PREFERENCE_DOMAIN: &str = "mil.navy.nrl.cmf.pkcs11";

/// Environment variable overriding the preference file location.
pub const CONFIG_PATH_ENV: &str = "HOSTKEY_PKCS11_CONFIG";

const DEFAULT_CERT_SEARCH: &[&str] = &["DoD Root CA"];
const DEFAULT_CERT_APPS: &[&str] = &["firefox", "thunderbird"];

/// User-preference lookup. A key maps to a list of strings; a missing key
/// falls back to the caller's default.
pub trait Preferences: Send + Sync {
    fn string_list(&self, key: &str) -> Option<Vec<String>>;
}

/// Per-process settings resolved at initialize time.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Relay login PINs into the local-auth primitive instead of letting
    /// the platform prompt, and clear protected-authentication-path from
    /// the token flags.
    pub ask_pin: bool,
    /// Expose the certificate pseudo-slot and run the background scan.
    pub cert_slot_enabled: bool,
    /// Substrings matched against certificate common names by the scan.
    /// Empty means the scan is disabled.
    pub cert_match: Vec<String>,
}

impl BridgeConfig {
    /// Resolve the configuration for the current program. `program` is the
    /// executable basename.
    pub fn resolve(prefs: &dyn Preferences, program: &str) -> Self {
        let ask_pin = prefkey_found(prefs, "askPIN", program, &[]);
        debug!(program, ask_pin, "askPIN preference resolved");

        let cert_slot_enabled = prefkey_found(prefs, "keychainCertSlot", program, DEFAULT_CERT_APPS);
        debug!(program, cert_slot_enabled, "keychainCertSlot preference resolved");

        let cert_match = cert_match_list(prefs);

        Self { ask_pin, cert_slot_enabled, cert_match }
    }

    /// Configuration with everything off, for hosts without preferences.
    pub fn disabled() -> Self {
        Self { ask_pin: false, cert_slot_enabled: false, cert_match: Vec::new() }
    }
}

/// Whether `value` is selected by the preference list under `key`. The
/// first entry may be the sentinel `all` or `none`; otherwise the list is
/// matched case-insensitively against `value`.
fn prefkey_found(prefs: &dyn Preferences, key: &str, value: &str, default_list: &[&str]) -> bool {
    let list = match prefs.string_list(key) {
        Some(list) if !list.is_empty() => list,
        _ => default_list.iter().map(|s| (*s).to_string()).collect(),
    };
    let Some(first) = list.first() else {
        return false;
    };
    if first.eq_ignore_ascii_case("all") {
        return true;
    }
    if first.eq_ignore_ascii_case("none") {
        return false;
    }
    list.iter().any(|entry| entry.eq_ignore_ascii_case(value))
}

/// The certificate common-name substrings; the single entry `none`
/// disables the scan entirely.
fn cert_match_list(prefs: &dyn Preferences) -> Vec<String> {
    let list = prefs
        .string_list("certificateList")
        .filter(|list| !list.is_empty())
        .unwrap_or_else(|| DEFAULT_CERT_SEARCH.iter().map(|s| (*s).to_string()).collect());
    if list.first().is_some_and(|first| first.eq_ignore_ascii_case("none")) {
        debug!("certificateList is \"none\", certificate import disabled");
        return Vec::new();
    }
    list
}

/// In-memory preferences, used by tests and embedders.
#[derive(Debug, Default, Clone)]
pub struct MemoryPreferences {
    values: HashMap<String, Vec<String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, values: impl IntoIterator<Item = impl Into<String>>) {
        self.values
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
    }
}

impl Preferences for MemoryPreferences {
    fn string_list(&self, key: &str) -> Option<Vec<String>> {
        self.values.get(key).cloned()
    }
}

/// TOML file in the user's configuration directory, named after the
/// preference domain. Keys hold either a string or an array of strings.
#[derive(Debug, Default)]
pub struct FilePreferences {
    values: HashMap<String, Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PrefValue {
    One(String),
    Many(Vec<String>),
}

impl FilePreferences {
    pub fn load_default() -> Self {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Self::default(),
        }
    }

    fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        let home = std::env::var_os("HOME")?;
        let mut path = PathBuf::from(home);
        path.push(".config");
        path.push(format!("{PREFERENCE_DOMAIN}.toml"));
        Some(path)
    }

    pub fn load(path: &std::path::Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %path.display(), %err, "no preference file");
                return Self::default();
            }
        };
        match toml::from_str::<HashMap<String, PrefValue>>(&text) {
            Ok(raw) => {
                let values = raw
                    .into_iter()
                    .map(|(key, value)| {
                        let list = match value {
                            PrefValue::One(one) => vec![one],
                            PrefValue::Many(many) => many,
                        };
                        (key, list)
                    })
                    .collect();
                Self { values }
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "preference file unparseable, ignoring");
                Self::default()
            }
        }
    }
}

impl Preferences for FilePreferences {
    fn string_list(&self, key: &str) -> Option<Vec<String>> {
        self.values.get(key).cloned()
    }
}

/// Basename of the running executable, the value preference lists match
/// against.
pub fn current_program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_default()
}
