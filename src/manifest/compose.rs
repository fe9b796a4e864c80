// ABOUTME: Typed view of a compose manifest, keeping unknown keys and service order.
// ABOUTME: Only fields the rewriter touches are typed; everything else round-trips as YAML.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use std::fmt;

/// Top-level keys that would let a deployment share state with the host or
/// with other deployments.
pub const SHARED_RESOURCE_KEYS: [&str; 4] = ["networks", "volumes", "configs", "secrets"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(with = "ordered_services")]
    pub services: Vec<(String, ComposeService)>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl ComposeManifest {
    pub fn service(&self, name: &str) -> Option<&ComposeService> {
        self.services
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, service)| service)
    }

    pub fn remove_shared_resources(&mut self) {
        for key in SHARED_RESOURCE_KEYS {
            self.extra.remove(key);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    #[serde(flatten)]
    pub extra: Mapping,
}

/// A service volume in short (`src:dst[:mode]`) or long (mapping) syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeSpec {
    Short(String),
    Long(LongVolume),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(flatten)]
    pub extra: Mapping,
}

impl VolumeSpec {
    /// Host side of the volume. Anonymous volumes have none.
    pub fn source(&self) -> Option<&str> {
        match self {
            VolumeSpec::Short(spec) => spec.split_once(':').map(|(source, _)| source),
            VolumeSpec::Long(long) => long.source.as_deref(),
        }
    }

    /// Same volume mounted from `source` instead.
    pub fn with_source(&self, source: &str) -> Self {
        match self {
            VolumeSpec::Short(spec) => match spec.split_once(':') {
                Some((_, rest)) => VolumeSpec::Short(format!("{source}:{rest}")),
                None => VolumeSpec::Short(spec.clone()),
            },
            VolumeSpec::Long(long) => VolumeSpec::Long(LongVolume {
                source: Some(source.to_string()),
                extra: long.extra.clone(),
            }),
        }
    }
}

/// Service environment in mapping or `KEY=value` list form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(Mapping),
    List(Vec<String>),
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

impl Environment {
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Environment::Map(map) => map.get(key).and_then(scalar_to_string),
            Environment::List(entries) => entries.iter().find_map(|entry| {
                match entry.split_once('=') {
                    Some((k, v)) if k == key => Some(v.to_string()),
                    None if entry == key => Some(String::new()),
                    _ => None,
                }
            }),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self {
            Environment::Map(map) => {
                map.insert(Value::String(key.to_string()), Value::String(value.to_string()));
            }
            Environment::List(entries) => {
                let entry = format!("{key}={value}");
                let existing = entries.iter_mut().find(|e| {
                    e.as_str() == key || e.split_once('=').is_some_and(|(k, _)| k == key)
                });
                match existing {
                    Some(slot) => *slot = entry,
                    None => entries.push(entry),
                }
            }
        }
    }

    /// Apply `rewrite` to every string value whose key is not in `protected`.
    pub fn rewrite_values(&mut self, protected: &[&str], rewrite: impl Fn(&str) -> String) {
        match self {
            Environment::Map(map) => {
                for (key, value) in map.iter_mut() {
                    let is_protected = key.as_str().is_some_and(|k| protected.contains(&k));
                    if !is_protected && let Value::String(s) = value {
                        *s = rewrite(s);
                    }
                }
            }
            Environment::List(entries) => {
                for entry in entries.iter_mut() {
                    if let Some((key, value)) = entry.split_once('=')
                        && !protected.contains(&key)
                    {
                        *entry = format!("{key}={}", rewrite(value));
                    }
                }
            }
        }
    }
}

/// Services as an ordered list, so output follows the input order.
mod ordered_services {
    use super::*;

    pub fn serialize<S: Serializer>(
        services: &[(String, ComposeService)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(services.len()))?;
        for (name, service) in services {
            map.serialize_entry(name, service)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, ComposeService)>, D::Error> {
        struct ServicesVisitor;

        impl<'de> Visitor<'de> for ServicesVisitor {
            type Value = Vec<(String, ComposeService)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of service names to services")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut services = Vec::new();
                while let Some((name, service)) = access.next_entry::<String, ComposeService>()? {
                    services.push((name, service));
                }
                Ok(services)
            }
        }

        deserializer.deserialize_map(ServicesVisitor)
    }
}
