//! Request validation against an algorithm's custom parameter schema
//!
//! Runs after the algorithm name is resolved and before the task reaches the
//! worker pool. The first offending parameter short-circuits admission.

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::algorithms::{AlgorithmDescriptor, CustomParameter, ParameterType, ValidationType};
use crate::core::TaskRequest;

/// Why a custom parameter was rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("{parameter} is not a custom parameter for algorithm {algorithm}")]
    Unknown { parameter: String, algorithm: String },

    #[error("{parameter} is a flag and does not take a value")]
    UnexpectedValue { parameter: String },

    #[error("{parameter} requires a value")]
    MissingValue { parameter: String },

    #[error("{parameter} value {value} is not a valid {expected}")]
    TypeMismatch {
        parameter: String,
        value: String,
        expected: &'static str,
    },

    #[error("{parameter} value {value} is less than the minimum of {min}")]
    BelowMinimum {
        parameter: String,
        value: String,
        min: f64,
    },

    #[error("{parameter} value {value} is greater than the maximum of {max}")]
    AboveMaximum {
        parameter: String,
        value: String,
        max: f64,
    },

    #[error("{parameter} value {value} failed validation: {help}")]
    PatternMismatch {
        parameter: String,
        value: String,
        help: String,
    },

    #[error("{parameter} has an invalid validation pattern: {reason}")]
    InvalidPattern { parameter: String, reason: String },
}

/// Checks a request against the descriptor of the algorithm it names
pub trait RequestValidator: Send + Sync {
    fn validate(
        &self,
        algorithm: &AlgorithmDescriptor,
        request: &TaskRequest,
    ) -> Result<(), ParameterError>;
}

/// Validator driven entirely by the declared parameter schema
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl RequestValidator for SchemaValidator {
    fn validate(
        &self,
        algorithm: &AlgorithmDescriptor,
        request: &TaskRequest,
    ) -> Result<(), ParameterError> {
        let Some(params) = &request.custom_parameters else {
            return Ok(());
        };

        for (name, value) in params {
            let schema = algorithm.custom_parameter(name).ok_or_else(|| {
                ParameterError::Unknown {
                    parameter: name.clone(),
                    algorithm: algorithm.name.clone(),
                }
            })?;
            check_parameter(schema, value.as_deref())?;
        }

        debug!(
            "Validated {} custom parameter(s) for algorithm {}",
            params.len(),
            algorithm.name
        );
        Ok(())
    }
}

fn check_parameter(schema: &CustomParameter, value: Option<&str>) -> Result<(), ParameterError> {
    let parameter = schema.name.clone();

    let value = match (schema.param_type, value) {
        (ParameterType::Flag, None) => return Ok(()),
        (ParameterType::Flag, Some(_)) => {
            return Err(ParameterError::UnexpectedValue { parameter });
        }
        (ParameterType::Value, None) => return Err(ParameterError::MissingValue { parameter }),
        (ParameterType::Value, Some(v)) => v,
    };

    let numeric = match schema.validation_type {
        Some(ValidationType::Number) => Some(
            value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| type_mismatch(schema, value, "number"))?,
        ),
        Some(ValidationType::Digits) => Some(
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| type_mismatch(schema, value, "integer"))? as f64,
        ),
        Some(ValidationType::String) | None => None,
    };

    if let Some(n) = numeric {
        if let Some(min) = schema.min_value {
            if n < min {
                return Err(ParameterError::BelowMinimum {
                    parameter,
                    value: value.to_string(),
                    min,
                });
            }
        }
        if let Some(max) = schema.max_value {
            if n > max {
                return Err(ParameterError::AboveMaximum {
                    parameter,
                    value: value.to_string(),
                    max,
                });
            }
        }
    }

    if let Some(pattern) = &schema.validation_regex {
        // whole-value match
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            ParameterError::InvalidPattern {
                parameter: parameter.clone(),
                reason: e.to_string(),
            }
        })?;
        if !regex.is_match(value) {
            let help = schema
                .validation_help
                .clone()
                .unwrap_or_else(|| format!("must match {}", pattern));
            return Err(ParameterError::PatternMismatch {
                parameter,
                value: value.to_string(),
                help,
            });
        }
    }

    Ok(())
}

fn type_mismatch(schema: &CustomParameter, value: &str, expected: &'static str) -> ParameterError {
    ParameterError::TypeMismatch {
        parameter: schema.name.clone(),
        value: value.to_string(),
        expected,
    }
}
