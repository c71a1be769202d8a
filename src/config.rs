//! C10 Config Registry: a typed, validated key/value store backed by a
//! `key=value` text file (spec.md §4.10, §6). Deliberately hand-rolled
//! rather than built on `toml` — the wire format itself is part of the
//! external contract, not an implementation detail.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bool,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl ConfigValue {
    fn kind(&self) -> ValueKind {
        match self {
            ConfigValue::Int(_) => ValueKind::Int,
            ConfigValue::Bool(_) => ValueKind::Bool,
            ConfigValue::Str(_) => ValueKind::String,
        }
    }

    fn to_wire(&self) -> String {
        match self {
            ConfigValue::Int(v) => v.to_string(),
            ConfigValue::Bool(v) => v.to_string(),
            ConfigValue::Str(v) => v.clone(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ConfigValue::Int(v) => Value::from(*v),
            ConfigValue::Bool(v) => Value::from(*v),
            ConfigValue::Str(v) => Value::from(v.clone()),
        }
    }

    fn parse_wire(raw: &str, kind: ValueKind) -> Option<ConfigValue> {
        match kind {
            ValueKind::Int => raw.trim().parse::<i64>().ok().map(ConfigValue::Int),
            ValueKind::Bool => match raw.trim() {
                "true" => Some(ConfigValue::Bool(true)),
                "false" => Some(ConfigValue::Bool(false)),
                _ => None,
            },
            ValueKind::String => Some(ConfigValue::Str(raw.to_string())),
        }
    }

    fn from_json(v: &Value, kind: ValueKind) -> Option<ConfigValue> {
        match kind {
            ValueKind::Int => v.as_i64().map(ConfigValue::Int),
            ValueKind::Bool => v.as_bool().map(ConfigValue::Bool),
            ValueKind::String => v.as_str().map(|s| ConfigValue::Str(s.to_string())),
        }
    }
}

type Validator = fn(&ConfigValue) -> Result<(), String>;

struct KeyDef {
    kind: ValueKind,
    remote: bool,
    default: ConfigValue,
    validator: Option<Validator>,
}

struct Entry {
    def: KeyDef,
    value: ConfigValue,
}

/// Process-wide settings consumed by C3 (Encoder Wrapper), C5 (Quality
/// Controller) and C9 (Still Capture). All public access is mutex-protected.
pub struct ConfigRegistry {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<&'static str, Entry>>,
}

fn in_range_i(lo: i64, hi: i64) -> impl Fn(&ConfigValue) -> Result<(), String> {
    move |v| match v {
        ConfigValue::Int(n) if *n >= lo && *n <= hi => Ok(()),
        ConfigValue::Int(n) => Err(format!("{n} not in [{lo},{hi}]")),
        _ => Err("expected integer".to_string()),
    }
}

fn one_of_i(allowed: &'static [i64]) -> impl Fn(&ConfigValue) -> Result<(), String> {
    move |v| match v {
        ConfigValue::Int(n) if allowed.contains(n) => Ok(()),
        ConfigValue::Int(n) => Err(format!("{n} not in {allowed:?}")),
        _ => Err("expected integer".to_string()),
    }
}

fn max_len(n: usize) -> impl Fn(&ConfigValue) -> Result<(), String> {
    move |v| match v {
        ConfigValue::Str(s) if s.chars().count() <= n => Ok(()),
        ConfigValue::Str(s) => Err(format!("length {} exceeds {n}", s.chars().count())),
        _ => Err("expected string".to_string()),
    }
}

fn one_of_s(allowed: &'static [&'static str]) -> impl Fn(&ConfigValue) -> Result<(), String> {
    move |v| match v {
        ConfigValue::Str(s) if allowed.contains(&s.as_str()) => Ok(()),
        ConfigValue::Str(s) => Err(format!("'{s}' not in {allowed:?}")),
        _ => Err("expected string".to_string()),
    }
}

macro_rules! validator_fn {
    ($name:ident, $body:expr) => {
        fn $name(v: &ConfigValue) -> Result<(), String> {
            ($body)(v)
        }
    };
}

validator_fn!(v_camera_index, one_of_i(&[0, 1, 2]));
validator_fn!(v_rotation, one_of_i(&[0, 90, 180, 270]));
validator_fn!(v_max_bitrate, in_range_i(200, 17_000_000));
validator_fn!(v_fixed_fps, in_range_i(5, 30));
validator_fn!(v_pct_signed, in_range_i(-100, 100));
validator_fn!(v_brightness, in_range_i(0, 100));
validator_fn!(v_ev, in_range_i(-10, 10));
validator_fn!(v_annotation_len, max_len(64));
validator_fn!(v_annotation_ratio, in_range_i(2, 10));
validator_fn!(
    v_exposure,
    one_of_s(&["auto", "night", "backlight", "spotlight", "sports", "snow", "beach"])
);
validator_fn!(v_flicker, one_of_s(&["off", "auto", "50hz", "60hz"]));
validator_fn!(v_awb, one_of_s(&["off", "auto", "sun", "cloud", "shade", "tungsten", "fluorescent"]));
validator_fn!(v_drc, one_of_s(&["off", "low", "medium", "high"]));
validator_fn!(v_still_max_age, in_range_i(1, 86_400));

fn key_table() -> Vec<(&'static str, KeyDef)> {
    vec![
        ("camera_index", KeyDef { kind: ValueKind::Int, remote: false, default: ConfigValue::Int(0), validator: Some(v_camera_index) }),
        ("rotation", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(0), validator: Some(v_rotation) }),
        ("flip_horizontal", KeyDef { kind: ValueKind::Bool, remote: true, default: ConfigValue::Bool(false), validator: None }),
        ("flip_vertical", KeyDef { kind: ValueKind::Bool, remote: true, default: ConfigValue::Bool(false), validator: None }),
        ("max_bitrate", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(2_000_000), validator: Some(v_max_bitrate) }),
        ("fixed_fps", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(30), validator: Some(v_fixed_fps) }),
        ("dynamic_fps", KeyDef { kind: ValueKind::Bool, remote: true, default: ConfigValue::Bool(false), validator: None }),
        ("dynamic_resolution", KeyDef { kind: ValueKind::Bool, remote: true, default: ConfigValue::Bool(true), validator: None }),
        ("use_4_3_resolution", KeyDef { kind: ValueKind::Bool, remote: true, default: ConfigValue::Bool(false), validator: None }),
        ("fixed_resolution_width", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(1280), validator: None }),
        ("fixed_resolution_height", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(720), validator: None }),
        ("sharpness", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(0), validator: Some(v_pct_signed) }),
        ("contrast", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(0), validator: Some(v_pct_signed) }),
        ("saturation", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(0), validator: Some(v_pct_signed) }),
        ("brightness", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(50), validator: Some(v_brightness) }),
        ("exposure_compensation", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(0), validator: Some(v_ev) }),
        ("exposure_mode", KeyDef { kind: ValueKind::Str, remote: true, default: ConfigValue::Str("auto".into()), validator: Some(v_exposure) }),
        ("flicker_mode", KeyDef { kind: ValueKind::Str, remote: true, default: ConfigValue::Str("auto".into()), validator: Some(v_flicker) }),
        ("awb_mode", KeyDef { kind: ValueKind::Str, remote: true, default: ConfigValue::Str("auto".into()), validator: Some(v_awb) }),
        ("drc_mode", KeyDef { kind: ValueKind::Str, remote: true, default: ConfigValue::Str("off".into()), validator: Some(v_drc) }),
        ("annotation_text", KeyDef { kind: ValueKind::Str, remote: true, default: ConfigValue::Str(String::new()), validator: Some(v_annotation_len) }),
        ("annotation_size_ratio", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(6), validator: Some(v_annotation_ratio) }),
        ("still_max_age_secs", KeyDef { kind: ValueKind::Int, remote: true, default: ConfigValue::Int(300), validator: Some(v_still_max_age) }),
        ("still_directory", KeyDef { kind: ValueKind::Str, remote: false, default: ConfigValue::Str("/tmp/still".into()), validator: None }),
    ]
}

impl ConfigRegistry {
    pub fn with_defaults() -> Self {
        let mut map = BTreeMap::new();
        for (name, def) in key_table() {
            let value = def.default.clone();
            map.insert(name, Entry { def, value });
        }
        ConfigRegistry {
            path: None,
            entries: Mutex::new(map),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let registry = Self::with_defaults();
        let path = path.as_ref().to_path_buf();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file missing, using defaults");
                return Ok(ConfigRegistry { path: Some(path), ..registry });
            }
            Err(e) => return Err(ConfigError::Unreadable(e)),
        };
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                warn!(line = lineno + 1, "config line missing '=', skipped");
                continue;
            };
            let key = key.trim();
            let val = val.trim();
            if let Err(e) = registry.set_raw(key, val) {
                warn!(line = lineno + 1, key, error = %e, "invalid config line, keeping default");
            }
        }
        Ok(ConfigRegistry {
            path: Some(path),
            ..registry
        })
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries = self.entries.lock();
        let mut out = String::new();
        out.push_str("# rpi-webrtc-streamer config\n");
        for (name, entry) in entries.iter() {
            out.push_str(name);
            out.push('=');
            out.push_str(&entry.value.to_wire());
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn reset_defaults(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.iter_mut() {
            entry.value = entry.def.default.clone();
        }
    }

    fn set_raw(&self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let parsed = ConfigValue::parse_wire(raw, entry.def.kind).ok_or_else(|| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "wrong type".to_string(),
        })?;
        if let Some(validate) = entry.def.validator {
            validate(&parsed).map_err(|reason| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
                reason,
            })?;
        }
        entry.value = parsed;
        Ok(())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.entries.lock().get(key)?.value {
            ConfigValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.lock().get(key)?.value {
            ConfigValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match &self.entries.lock().get(key)?.value {
            ConfigValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Applies only keys whose remote-access flag is true and whose values
    /// validate (spec.md §4.10). Returns the set of keys actually changed.
    pub fn patch_from_json(&self, obj: &Value) -> Result<Vec<String>, ConfigError> {
        let Value::Object(map) = obj else {
            return Err(ConfigError::Invalid {
                key: String::new(),
                value: obj.to_string(),
                reason: "patch must be a JSON object".to_string(),
            });
        };
        let mut entries = self.entries.lock();
        let mut changed = Vec::new();
        for (key, json_val) in map {
            let Some(entry) = entries.get_mut(key.as_str()) else {
                continue;
            };
            if !entry.def.remote {
                continue;
            }
            let parsed = ConfigValue::from_json(json_val, entry.def.kind).ok_or_else(|| ConfigError::Invalid {
                key: key.clone(),
                value: json_val.to_string(),
                reason: "wrong type".to_string(),
            })?;
            if let Some(validate) = entry.def.validator {
                validate(&parsed).map_err(|reason| ConfigError::Invalid {
                    key: key.clone(),
                    value: json_val.to_string(),
                    reason,
                })?;
            }
            entry.value = parsed;
            changed.push(key.clone());
        }
        Ok(changed)
    }

    /// Serializes remote-editable keys to JSON (`ConfigToJson` in spec.md §8).
    pub fn to_json(&self) -> Value {
        let entries = self.entries.lock();
        let mut map = serde_json::Map::new();
        for (name, entry) in entries.iter() {
            if entry.def.remote {
                map.insert(name.to_string(), entry.value.to_json());
            }
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let registry = ConfigRegistry::with_defaults();
        assert_eq!(registry.get_int("camera_index"), Some(0));
        assert_eq!(registry.get_bool("dynamic_resolution"), Some(true));
    }

    #[test]
    fn rejects_unknown_key_via_patch() {
        let registry = ConfigRegistry::with_defaults();
        let patch = serde_json::json!({"not_a_real_key": 1});
        let changed = registry.patch_from_json(&patch).unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn silently_omits_non_remote_key() {
        let registry = ConfigRegistry::with_defaults();
        let patch = serde_json::json!({"camera_index": 1});
        let changed = registry.patch_from_json(&patch).unwrap();
        assert!(changed.is_empty());
        assert_eq!(registry.get_int("camera_index"), Some(0));
    }

    #[test]
    fn patch_then_to_json_round_trips_patched_value() {
        let registry = ConfigRegistry::with_defaults();
        let patch = serde_json::json!({"rotation": 180, "brightness": 70});
        let changed = registry.patch_from_json(&patch).unwrap();
        assert_eq!(changed.len(), 2);
        let json = registry.to_json();
        assert_eq!(json["rotation"], 180);
        assert_eq!(json["brightness"], 70);
    }

    #[test]
    fn rejects_out_of_range_rotation() {
        let registry = ConfigRegistry::with_defaults();
        let patch = serde_json::json!({"rotation": 45});
        assert!(registry.patch_from_json(&patch).is_err());
        assert_eq!(registry.get_int("rotation"), Some(0));
    }

    #[test]
    fn parses_key_value_text_format() {
        let dir = std::env::temp_dir().join(format!("rwc-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("streamer.conf");
        std::fs::write(&path, "# comment\nrotation=90\nbrightness=40\n").unwrap();
        let registry = ConfigRegistry::load(&path).unwrap();
        assert_eq!(registry.get_int("rotation"), Some(90));
        assert_eq!(registry.get_int("brightness"), Some(40));
    }
}
