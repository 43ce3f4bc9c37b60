//! Search space definitions and parameter values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::SearchSpaceError;

/// A concrete assignment of values to named parameters.
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name as the evaluator expects it (e.g. "monoBThick").
    pub name: String,
    /// The domain values are drawn from.
    pub domain: ParameterDomain,
}

/// Describes the admissible values of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterDomain {
    /// Closed real interval [low, high].
    Continuous { low: f64, high: f64 },
    /// Integers in [low, high] inclusive.
    Discrete { low: i64, high: i64 },
    /// Closed real interval sampled in log-space. Requires `low > 0`.
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Categorical { values: Vec<serde_json::Value> },
}

impl ParameterDomain {
    /// Whether `value` lies inside this domain.
    pub fn admits(&self, value: &ParameterValue) -> bool {
        match self {
            Self::Continuous { low, high } | Self::LogUniform { low, high } => value
                .as_f64()
                .is_some_and(|v| v.is_finite() && v >= *low && v <= *high),
            Self::Discrete { low, high } => match value {
                ParameterValue::Int(v) => v >= low && v <= high,
                _ => false,
            },
            Self::Categorical { values } => {
                let candidate = value.to_json();
                values.iter().any(|v| *v == candidate)
            }
        }
    }
}

/// A concrete parameter value produced by a search algorithm.
///
/// Variant order matters for untagged deserialization: integral JSON numbers
/// come back as `Int`, fractional ones as `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }

    /// Normalise a JSON value so numbers land in the same variant they would
    /// after a serialization round trip.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let Some(v) = value.as_i64() {
            Self::Int(v)
        } else if let Some(v) = value.as_f64() {
            Self::Float(v)
        } else {
            Self::Json(value)
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Raw, unvalidated parameter description as it appears in configuration.
///
/// ```json
/// {"name": "x1", "kind": "continuous", "bounds": [-5.0, 5.0]}
/// {"name": "material", "kind": "categorical", "values": ["W", "CuCrZr"]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    /// Validate raw descriptors and normalise them into a search space.
    pub fn validate(descriptors: &[ParameterDescriptor]) -> Result<Self, SearchSpaceError> {
        let mut space = Self::new();
        for descriptor in descriptors {
            let domain = Self::parse_domain(descriptor)?;
            space.parameters.push(ParameterDef {
                name: descriptor.name.clone(),
                domain,
            });
        }
        space.check()?;
        Ok(space)
    }

    fn parse_domain(descriptor: &ParameterDescriptor) -> Result<ParameterDomain, SearchSpaceError> {
        let name = &descriptor.name;
        let bounds = || {
            descriptor.bounds.ok_or_else(|| SearchSpaceError::MissingField {
                name: name.clone(),
                field: "bounds".to_string(),
            })
        };

        match descriptor.kind.as_str() {
            "continuous" | "uniform" => {
                let [low, high] = bounds()?;
                Ok(ParameterDomain::Continuous { low, high })
            }
            "log_uniform" | "loguniform" => {
                let [low, high] = bounds()?;
                Ok(ParameterDomain::LogUniform { low, high })
            }
            "discrete" | "integer" => {
                let [low, high] = bounds()?;
                if low.fract() != 0.0 || high.fract() != 0.0 || !low.is_finite() || !high.is_finite() {
                    return Err(SearchSpaceError::InvalidBounds {
                        name: name.clone(),
                        low,
                        high,
                        reason: "discrete bounds must be integers".to_string(),
                    });
                }
                Ok(ParameterDomain::Discrete {
                    low: low as i64,
                    high: high as i64,
                })
            }
            "categorical" | "choice" => {
                let values = descriptor
                    .values
                    .clone()
                    .ok_or_else(|| SearchSpaceError::MissingField {
                        name: name.clone(),
                        field: "values".to_string(),
                    })?;
                Ok(ParameterDomain::Categorical { values })
            }
            other => Err(SearchSpaceError::UnsupportedKind {
                name: name.clone(),
                kind: other.to_string(),
            }),
        }
    }

    /// Check the structural invariants of an already-built space.
    pub fn check(&self) -> Result<(), SearchSpaceError> {
        if self.parameters.is_empty() {
            return Err(SearchSpaceError::Empty);
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(SearchSpaceError::DuplicateName {
                    name: param.name.clone(),
                });
            }

            let invalid = |low: f64, high: f64, reason: &str| SearchSpaceError::InvalidBounds {
                name: param.name.clone(),
                low,
                high,
                reason: reason.to_string(),
            };

            match &param.domain {
                ParameterDomain::Continuous { low, high } => {
                    if !low.is_finite() || !high.is_finite() {
                        return Err(invalid(*low, *high, "bounds must be finite"));
                    }
                    if low >= high {
                        return Err(invalid(*low, *high, "lower bound must be below upper bound"));
                    }
                }
                ParameterDomain::LogUniform { low, high } => {
                    if !low.is_finite() || !high.is_finite() {
                        return Err(invalid(*low, *high, "bounds must be finite"));
                    }
                    if *low <= 0.0 {
                        return Err(invalid(*low, *high, "log-uniform bounds must be positive"));
                    }
                    if low >= high {
                        return Err(invalid(*low, *high, "lower bound must be below upper bound"));
                    }
                }
                ParameterDomain::Discrete { low, high } => {
                    if low >= high {
                        return Err(invalid(
                            *low as f64,
                            *high as f64,
                            "lower bound must be below upper bound",
                        ));
                    }
                }
                ParameterDomain::Categorical { values } => {
                    if values.is_empty() {
                        return Err(SearchSpaceError::EmptyChoices {
                            name: param.name.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn add_continuous(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            domain: ParameterDomain::Continuous { low, high },
        });
        self
    }

    pub fn add_discrete(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            domain: ParameterDomain::Discrete { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            domain: ParameterDomain::LogUniform { low, high },
        });
        self
    }

    pub fn add_categorical(
        mut self,
        name: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            domain: ParameterDomain::Categorical { values },
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// True only if every key is declared and every value lies within its domain.
    pub fn contains(&self, parameters: &ParameterSet) -> bool {
        parameters.iter().all(|(name, value)| {
            self.get(name)
                .is_some_and(|param| param.domain.admits(value))
        })
    }

    /// Like [`contains`](Self::contains), but also requires every declared
    /// parameter to be assigned.
    pub fn is_complete_assignment(&self, parameters: &ParameterSet) -> bool {
        self.parameters.len() == parameters.len() && self.contains(parameters)
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.domain {
                ParameterDomain::Discrete { low, high } => usize::try_from(high - low + 1).ok()?,
                ParameterDomain::Categorical { values } => values.len(),
                _ => return None,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}
