//! Key paths into YAML documents.
//!
//! A [`KeyPath`] is parsed once from its dotted text form into typed
//! [`Step`]s and then applied to a [`serde_yaml::Value`]:
//!
//! | Text | Steps |
//! |------|-------|
//! | `spec.source.targetRevision` | field, field, field |
//! | `spec.containers.0.image` | field, field, index 0, field |
//! | `spec.containers[0].image` | field, field, index 0, field |
//! | `items.[2]` | field, index 2 |
//!
//! Navigation requires every intermediate step to exist. The final step of
//! [`KeyPath::set`] may add a new mapping field; sequence indices must
//! already be in range.

use serde_yaml::{Mapping, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One navigation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Field(String),
    Index(usize),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Field(name) => write!(f, ".{}", name),
            Step::Index(i) => write!(f, "[{}]", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("key path is empty")]
    Empty,

    #[error("invalid key path segment '{0}'")]
    InvalidSegment(String),

    #[error("no field '{field}' under '{at}'")]
    MissingField { field: String, at: String },

    #[error("index {index} out of range under '{at}' (length {len})")]
    IndexOutOfRange { index: usize, len: usize, at: String },

    #[error("cannot apply '{step}' to a {found} at '{at}'")]
    TypeMismatch {
        step: String,
        found: &'static str,
        at: String,
    },
}

/// A parsed key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    steps: Vec<Step>,
}

impl KeyPath {
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Read the value at this path.
    pub fn get<'a>(&self, root: &'a Value) -> Result<&'a Value, PathError> {
        let mut current = root;
        for (depth, step) in self.steps.iter().enumerate() {
            current = child(current, step, &self.prefix(depth))?;
        }
        Ok(current)
    }

    /// Assign `value` at this path.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let (last, parents) = self.steps.split_last().ok_or(PathError::Empty)?;

        let mut current = root;
        for (depth, step) in parents.iter().enumerate() {
            let at = self.prefix(depth);
            current = child_mut(current, step, &at)?;
        }

        let at = self.prefix(parents.len());
        match (last, current) {
            (Step::Field(name), Value::Mapping(map)) => {
                map.insert(Value::String(name.clone()), value);
                Ok(())
            }
            (Step::Index(i), Value::Sequence(items)) => {
                let len = items.len();
                let slot = items.get_mut(*i).ok_or(PathError::IndexOutOfRange {
                    index: *i,
                    len,
                    at,
                })?;
                *slot = value;
                Ok(())
            }
            (Step::Index(i), Value::Mapping(map)) => {
                let key = index_key(map, *i);
                map.insert(key, value);
                Ok(())
            }
            (step, other) => Err(PathError::TypeMismatch {
                step: step.to_string(),
                found: kind(other),
                at,
            }),
        }
    }

    /// Text form of the first `depth` steps, for error messages.
    fn prefix(&self, depth: usize) -> String {
        let text: String = self.steps[..depth].iter().map(Step::to_string).collect();
        let text = text.trim_start_matches('.');
        if text.is_empty() {
            "<root>".to_string()
        } else {
            text.to_string()
        }
    }
}

impl FromStr for KeyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(PathError::Empty);
        }

        let mut steps = Vec::new();
        for segment in s.split('.') {
            parse_segment(segment, &mut steps)?;
        }
        Ok(Self { steps })
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix(self.steps.len()))
    }
}

/// Parse one dot-separated segment: `name`, `0`, `[0]`, or `name[0][1]`.
fn parse_segment(segment: &str, steps: &mut Vec<Step>) -> Result<(), PathError> {
    let invalid = || PathError::InvalidSegment(segment.to_string());

    if segment.is_empty() {
        return Err(invalid());
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        steps.push(Step::Index(segment.parse().map_err(|_| invalid())?));
        return Ok(());
    }

    let (name, mut rest) = match segment.find('[') {
        Some(pos) => segment.split_at(pos),
        None => (segment, ""),
    };
    if name.contains(']') {
        return Err(invalid());
    }
    if !name.is_empty() {
        steps.push(Step::Field(name.to_string()));
    }

    while !rest.is_empty() {
        let inner = rest.strip_prefix('[').ok_or_else(invalid)?;
        let close = inner.find(']').ok_or_else(invalid)?;
        let index = inner[..close].parse::<usize>().map_err(|_| invalid())?;
        steps.push(Step::Index(index));
        rest = &inner[close + 1..];
    }
    Ok(())
}

fn child<'a>(node: &'a Value, step: &Step, at: &str) -> Result<&'a Value, PathError> {
    match (step, node) {
        (Step::Field(name), Value::Mapping(map)) => {
            map.get(name.as_str()).ok_or_else(|| PathError::MissingField {
                field: name.clone(),
                at: at.to_string(),
            })
        }
        (Step::Index(i), Value::Sequence(items)) => {
            items.get(*i).ok_or_else(|| PathError::IndexOutOfRange {
                index: *i,
                len: items.len(),
                at: at.to_string(),
            })
        }
        (Step::Index(i), Value::Mapping(map)) => {
            map.get(index_key(map, *i)).ok_or_else(|| PathError::MissingField {
                field: i.to_string(),
                at: at.to_string(),
            })
        }
        (step, other) => Err(PathError::TypeMismatch {
            step: step.to_string(),
            found: kind(other),
            at: at.to_string(),
        }),
    }
}

fn child_mut<'a>(node: &'a mut Value, step: &Step, at: &str) -> Result<&'a mut Value, PathError> {
    match (step, node) {
        (Step::Field(name), Value::Mapping(map)) => {
            map.get_mut(name.as_str())
                .ok_or_else(|| PathError::MissingField {
                    field: name.clone(),
                    at: at.to_string(),
                })
        }
        (Step::Index(i), Value::Sequence(items)) => {
            let len = items.len();
            items.get_mut(*i).ok_or_else(|| PathError::IndexOutOfRange {
                index: *i,
                len,
                at: at.to_string(),
            })
        }
        (Step::Index(i), Value::Mapping(map)) => {
            let key = index_key(map, *i);
            map.get_mut(&key).ok_or_else(|| PathError::MissingField {
                field: i.to_string(),
                at: at.to_string(),
            })
        }
        (step, other) => Err(PathError::TypeMismatch {
            step: step.to_string(),
            found: kind(other),
            at: at.to_string(),
        }),
    }
}

/// Key used when an index addresses a mapping: the integer key if present,
/// otherwise its string spelling if present, otherwise the integer key.
fn index_key(map: &Mapping, index: usize) -> Value {
    let numeric = Value::Number(serde_yaml::Number::from(index as u64));
    if map.contains_key(&numeric) {
        return numeric;
    }
    let text = Value::String(index.to_string());
    if map.contains_key(&text) {
        text
    } else {
        numeric
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
