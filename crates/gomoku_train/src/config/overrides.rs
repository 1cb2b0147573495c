//! Command-line overrides: `key.path=value`, `+key.path=value`, `~key.path`.

use std::str::FromStr;

use serde_yaml::{Mapping, Value};

use super::ConfigError;

#[derive(Clone, Debug, PartialEq)]
pub enum Override {
    /// Replace a key that already exists.
    Set(Vec<String>, Value),
    /// Add a key that does not exist yet.
    Add(Vec<String>, Value),
    Delete(Vec<String>),
}

fn split_path(raw: &str, path: &str) -> Result<Vec<String>, ConfigError> {
    let keys: Vec<String> = path.trim().split('.').map(str::to_string).collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(ConfigError::BadOverride(raw.to_string()));
    }
    Ok(keys)
}

/// Parses the right-hand side as YAML, so `null`, `1e-3` and `[0,1]` keep their type.
fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::String(String::new());
    }
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl FromStr for Override {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix('~') {
            // `~key=value` is accepted, the value is ignored.
            let path = path.split_once('=').map_or(path, |(p, _)| p);
            return Ok(Override::Delete(split_path(s, path)?));
        }
        let (add, body) = match s.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (path, value) = body
            .split_once('=')
            .ok_or_else(|| ConfigError::BadOverride(s.to_string()))?;
        let keys = split_path(s, path)?;
        let value = parse_value(value);
        Ok(if add {
            Override::Add(keys, value)
        } else {
            Override::Set(keys, value)
        })
    }
}

impl Override {
    fn keys(&self) -> &[String] {
        match self {
            Override::Set(k, _) | Override::Add(k, _) | Override::Delete(k) => k,
        }
    }

    /// Applies the override in place.
    pub fn apply(&self, root: &mut Value) -> Result<(), ConfigError> {
        let keys = self.keys();
        let dotted = keys.join(".");
        let (last, parents) = keys
            .split_last()
            .ok_or_else(|| ConfigError::BadOverride(dotted.clone()))?;

        let create = matches!(self, Override::Add(..));
        let mut node = root;
        for key in parents {
            if matches!(node, Value::Null) && create {
                *node = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = node else {
                return Err(ConfigError::OverrideMissing(dotted));
            };
            let slot = Value::String(key.clone());
            if !map.contains_key(&slot) {
                if !create {
                    return Err(ConfigError::OverrideMissing(dotted));
                }
                map.insert(slot.clone(), Value::Mapping(Mapping::new()));
            }
            node = map
                .get_mut(&slot)
                .ok_or_else(|| ConfigError::OverrideMissing(dotted.clone()))?;
        }

        if matches!(node, Value::Null) && create {
            *node = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = node else {
            return Err(ConfigError::OverrideMissing(dotted));
        };
        let slot = Value::String(last.clone());
        match self {
            Override::Set(_, value) => match map.get_mut(&slot) {
                Some(existing) => *existing = value.clone(),
                None => return Err(ConfigError::OverrideMissing(dotted)),
            },
            Override::Add(_, value) => {
                if map.contains_key(&slot) {
                    return Err(ConfigError::OverrideExists(dotted));
                }
                map.insert(slot, value.clone());
            }
            Override::Delete(_) => {
                if map.remove(&slot).is_none() {
                    return Err(ConfigError::OverrideMissing(dotted));
                }
            }
        }
        Ok(())
    }
}

/// Parses and applies every override in order.
pub fn apply_all<S: AsRef<str>>(root: &mut Value, overrides: &[S]) -> Result<(), ConfigError> {
    for raw in overrides {
        let o: Override = raw.as_ref().parse()?;
        o.apply(root)?;
        tracing::debug!("applied override {}", raw.as_ref());
    }
    Ok(())
}
