use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::descriptor::{pad_labels, CommandDescriptor, DescriptorError, Requirement};

const EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

// Only the named command sets matter; every other package.json field is ignored.
#[derive(Debug, Deserialize)]
struct PackageManifest {
    #[serde(rename = "aggregate-commands", default)]
    commands: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find config file '{}'", .0.display())]
    NotFound(PathBuf),
    #[error("Failed loading config file '{}' ({reason})", .path.display())]
    Load { path: PathBuf, reason: String },
    #[error("Invalid config{}: {reason}", item_suffix(.item))]
    Invalid { item: Option<usize>, reason: String },
    #[error("Invalid config (item #{item}): {source}")]
    Descriptor {
        item: usize,
        #[source]
        source: DescriptorError,
    },
}

fn item_suffix(item: &Option<usize>) -> String {
    match item {
        Some(i) => format!(" (item #{})", i),
        None => " ".to_string(),
    }
}

impl ConfigError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::NotFound(_) | ConfigError::Load { .. } => 2,
            ConfigError::Invalid { .. } | ConfigError::Descriptor { .. } => 1,
        }
    }

    fn invalid(item: usize, reason: &str) -> Self {
        ConfigError::Invalid {
            item: Some(item),
            reason: reason.to_string(),
        }
    }
}

/*
    @@@
    @parser();
    . Looks up `name` (its basename) under the "aggregate-commands" key of ./package.json.
    . Falls back to a dedicated config file; a name without extension is tried as .json, .yaml then .yml.
    . Normalizes whatever shape was found into descriptors and pads their labels.
*/
pub fn parser(name: &str) -> Result<Vec<CommandDescriptor>, ConfigError> {
    parser_in(Path::new("."), name)
}

pub fn parser_in(dir: &Path, name: &str) -> Result<Vec<CommandDescriptor>, ConfigError> {
    let raw = match commands_from_package(dir, name) {
        Some(raw) => raw,
        None => commands_from_file(dir, name)?,
    };

    let mut commands = normalize(raw)?;
    pad_labels(&mut commands);
    Ok(commands)
}

// Any problem with package.json is silent so the dedicated file can take over.
fn commands_from_package(dir: &Path, name: &str) -> Option<Value> {
    let key = Path::new(name).file_name()?.to_str()?;
    let data = fs::read_to_string(dir.join("package.json")).ok()?;
    let mut pkg: PackageManifest = serde_json::from_str(&data).ok()?;

    match pkg.commands.remove(key)? {
        Value::Null => None,
        commands => Some(commands),
    }
}

fn resolve_config_path(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if path.extension().is_some() || path.is_file() {
        return path;
    }

    EXTENSIONS
        .iter()
        .map(|ext| path.with_extension(ext))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| path.with_extension(EXTENSIONS[0]))
}

fn commands_from_file(dir: &Path, name: &str) -> Result<Value, ConfigError> {
    let path = resolve_config_path(dir, name);

    let data = fs::read_to_string(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConfigError::NotFound(path.clone()),
        _ => ConfigError::Load {
            path: path.clone(),
            reason: e.to_string(),
        },
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed = if is_yaml {
        serde_yaml::from_str::<Value>(&data).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<Value>(&data).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| ConfigError::Load { path, reason })
}

/*
    @@@
    @normalize();
    . Array form: every item is [required?, label, executable, args...]; a leading bool/null is the requirement marker.
    . Object form: { label: "cmd string" } (split on whitespace) or { label: ["cmd", "args"...] }, always Unspecified.
    . Anything else is rejected with the item index that broke it.
*/
pub fn normalize(raw: Value) -> Result<Vec<CommandDescriptor>, ConfigError> {
    match raw {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| from_list_item(i, item))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .enumerate()
            .map(|(i, (label, command))| from_entry(i, label, command))
            .collect(),
        _ => Err(ConfigError::Invalid {
            item: None,
            reason: "array expected".to_string(),
        }),
    }
}

fn from_list_item(i: usize, item: Value) -> Result<CommandDescriptor, ConfigError> {
    let Value::Array(parts) = item else {
        return Err(ConfigError::invalid(i, "array expected"));
    };
    if parts.len() < 2 {
        return Err(ConfigError::invalid(i, "at least 2 elements expected"));
    }

    // A leading string means the requirement marker was left out.
    let (required, skip) = match &parts[0] {
        Value::Bool(b) => (Requirement::from_marker(Some(*b)), 1),
        Value::Null => (Requirement::Unspecified, 1),
        Value::String(_) => (Requirement::Unspecified, 0),
        _ => return Err(ConfigError::invalid(i, "first element must be a label, a boolean or null")),
    };

    let mut rest = strings(i, parts.into_iter().skip(skip))?.into_iter();
    let label = rest.next().unwrap_or_default();
    let Some(executable) = rest.next() else {
        return Err(ConfigError::invalid(i, "executable expected after label"));
    };

    CommandDescriptor::new(required, label, executable, rest.collect())
        .map_err(|source| ConfigError::Descriptor { item: i, source })
}

fn from_entry(i: usize, label: String, command: Value) -> Result<CommandDescriptor, ConfigError> {
    let mut words = match command {
        Value::String(line) => line.split_whitespace().map(str::to_string).collect::<Vec<_>>(),
        Value::Array(parts) => strings(i, parts.into_iter())?,
        _ => return Err(ConfigError::invalid(i, "command string or array expected")),
    }
    .into_iter();

    let executable = words.next().unwrap_or_default();
    CommandDescriptor::new(Requirement::Unspecified, label, executable, words.collect())
        .map_err(|source| ConfigError::Descriptor { item: i, source })
}

fn strings(i: usize, values: impl Iterator<Item = Value>) -> Result<Vec<String>, ConfigError> {
    values
        .map(|v| match v {
            Value::String(s) => Ok(s),
            _ => Err(ConfigError::invalid(i, "strings expected")),
        })
        .collect()
}
