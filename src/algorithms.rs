//! Algorithm descriptors: container image and custom parameter schema per algorithm
//!
//! Descriptors are loaded once at startup, either from `[algorithms.<name>]`
//! tables in the service configuration or from a standalone TOML/JSON file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a custom parameter is passed on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// `--name value`
    #[default]
    Value,
    /// `--name` alone
    Flag,
}

/// Expected shape of a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationType {
    /// Any finite floating point number
    Number,
    /// An integer
    Digits,
    /// Free text, optionally constrained by `validation_regex`
    String,
}

/// Declared schema of one custom parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomParameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_type: Option<ValidationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Static metadata binding an algorithm name to its container image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmDescriptor {
    /// Filled from the table key when omitted
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub docker_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data_format: Option<String>,
    #[serde(default)]
    pub custom_parameters: Vec<CustomParameter>,
}

impl AlgorithmDescriptor {
    pub fn new(name: impl Into<String>, docker_image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docker_image: docker_image.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, parameter: CustomParameter) -> Self {
        self.custom_parameters.push(parameter);
        self
    }

    /// Look up a declared parameter by its exact name
    pub fn custom_parameter(&self, name: &str) -> Option<&CustomParameter> {
        self.custom_parameters.iter().find(|p| p.name == name)
    }
}

/// Read-only set of algorithms keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSet {
    pub algorithms: BTreeMap<String, AlgorithmDescriptor>,
}

impl AlgorithmSet {
    pub fn new(descriptors: impl IntoIterator<Item = AlgorithmDescriptor>) -> Self {
        let algorithms = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { algorithms }
    }

    /// Build from a name -> descriptor map, filling in missing names
    pub fn from_map(map: BTreeMap<String, AlgorithmDescriptor>) -> Self {
        let algorithms = map
            .into_iter()
            .map(|(name, mut descriptor)| {
                if descriptor.name.is_empty() {
                    descriptor.name = name.clone();
                }
                (name, descriptor)
            })
            .collect();
        Self { algorithms }
    }

    /// Parse top-level `[name]` tables
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, AlgorithmDescriptor> =
            toml::from_str(content).map_err(|e| ConfigError::Parse {
                origin: "algorithm TOML".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::from_map(raw))
    }

    /// Parse `{"algorithms": {name: descriptor}}`
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let raw: AlgorithmSet = serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            origin: "algorithm JSON".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::from_map(raw.algorithms))
    }

    /// Load from a file, choosing the format by extension (`.json` or TOML)
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn get(&self, name: &str) -> Option<&AlgorithmDescriptor> {
        self.algorithms.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlgorithmDescriptor> {
        self.algorithms.values()
    }
}

/// Public description of the service, served at the application root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetaData {
    pub name: String,
    pub description: String,
    pub input_data_format: String,
    pub output_data_format: String,
    pub algorithms: Vec<AlgorithmDescriptor>,
}

impl ServiceMetaData {
    /// Only algorithms that accept CX2 input are advertised
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_data_format: impl Into<String>,
        output_data_format: impl Into<String>,
        algorithms: Option<&AlgorithmSet>,
    ) -> Self {
        let algorithms = algorithms
            .map(|set| {
                set.iter()
                    .filter(|a| {
                        a.input_data_format
                            .as_deref()
                            .map(|f| f.eq_ignore_ascii_case("cx2"))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: name.into(),
            description: description.into(),
            input_data_format: input_data_format.into(),
            output_data_format: output_data_format.into(),
            algorithms,
        }
    }
}
