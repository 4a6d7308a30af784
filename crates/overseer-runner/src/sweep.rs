use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Slack applied when counting axis points so that `(end - start) / step`
/// landing just under an integer still includes the end point.
const COUNT_EPSILON: f64 = 1e-9;
const NORMALIZE_SCALE: f64 = 1e9;
const FORMAT_DECIMALS: usize = 6;

#[derive(Debug, Error, PartialEq)]
pub enum SweepError {
    #[error("sweep declares no axes")]
    NoAxes,
    #[error("cyclic sweep '{0}' has no values")]
    EmptyCycle(String),
    #[error("axis '{name}': {reason}")]
    InvalidAxis { name: String, reason: String },
    #[error("duplicate axis name: {0}")]
    DuplicateAxis(String),
    #[error("invalid parameter name '{0}': use ASCII letters, digits, '_' or '-'")]
    InvalidName(String),
    #[error("grid has too many points to enumerate")]
    TooManyPoints,
}

/// Rounds away floating-point noise so that values produced by
/// `start + i * step` compare and format identically to their literal form.
pub fn normalize(value: f64) -> f64 {
    let v = (value * NORMALIZE_SCALE).round() / NORMALIZE_SCALE;
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

/// Renders a parameter value as a stable, filename-safe token.
///
/// Integral values have no fractional part (`7`), fractional values keep at
/// most six decimals with trailing zeros removed (`0.5`, `0.002`).
pub fn format_value(value: f64) -> String {
    let v = normalize(value);
    if v.fract() == 0.0 && v.abs() < 1e15 {
        return format!("{}", v as i64);
    }
    let fixed = format!("{:.*}", FORMAT_DECIMALS, v);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One swept dimension: `start`, `start + step`, ... up to and including `end`.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct Axis {
    pub name: String,
    pub start: f64,
    pub step: f64,
    pub end: f64,
}

impl Axis {
    pub fn new(name: &str, start: f64, step: f64, end: f64) -> Self {
        Self {
            name: name.to_string(),
            start,
            step,
            end,
        }
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        if !is_valid_name(&self.name) {
            return Err(SweepError::InvalidName(self.name.clone()));
        }
        let invalid = |reason: &str| SweepError::InvalidAxis {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if !(self.start.is_finite() && self.step.is_finite() && self.end.is_finite()) {
            return Err(invalid("start, step and end must be finite"));
        }
        if self.step <= 0.0 {
            return Err(invalid("step must be positive"));
        }
        if self.end < self.start {
            return Err(invalid("end must not be below start"));
        }
        Ok(())
    }

    /// `None` when the span holds more points than a `usize` can count.
    pub fn checked_point_count(&self) -> Option<usize> {
        let steps = ((self.end - self.start) / self.step + COUNT_EPSILON).floor();
        if !steps.is_finite() || steps >= usize::MAX as f64 {
            return None;
        }
        (steps as usize).checked_add(1)
    }

    pub fn point_count(&self) -> usize {
        self.checked_point_count().unwrap_or(usize::MAX)
    }

    pub fn value_at(&self, index: usize) -> f64 {
        normalize(self.start + index as f64 * self.step)
    }

    pub fn values(&self) -> Vec<f64> {
        (0..self.point_count()).map(|i| self.value_at(i)).collect()
    }
}

/// An ordered set of named parameter values for one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTuple {
    values: Vec<(String, f64)>,
}

impl ParameterTuple {
    pub fn new(values: Vec<(String, f64)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(name, value)| (name, normalize(value)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `gain0.5_delay0.002`, in tuple order.
    pub fn file_token(&self) -> String {
        self.values
            .iter()
            .map(|(n, v)| format!("{}{}", n, format_value(*v)))
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl fmt::Display for ParameterTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .values
            .iter()
            .map(|(n, v)| format!("{}={}", n, format_value(*v)))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(" "))
    }
}

impl Serialize for ParameterTuple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone)]
enum SweepKind {
    Grid {
        axes: Vec<Axis>,
        cursor: Option<Vec<usize>>,
    },
    Cycle {
        name: String,
        values: Vec<f64>,
        position: usize,
    },
}

/// Lazily enumerates parameter tuples.
///
/// A grid sweep is the finite cartesian product of its axes in nested-loop
/// order: the first declared axis varies slowest, the last fastest. A cycle
/// sweep walks an explicit value list and wraps around forever.
#[derive(Debug, Clone)]
pub struct ParameterSweep {
    kind: SweepKind,
}

impl ParameterSweep {
    pub fn grid(axes: Vec<Axis>) -> Result<Self, SweepError> {
        if axes.is_empty() {
            return Err(SweepError::NoAxes);
        }
        let mut seen = BTreeSet::new();
        for axis in &axes {
            axis.validate()?;
            if !seen.insert(axis.name.clone()) {
                return Err(SweepError::DuplicateAxis(axis.name.clone()));
            }
        }
        axes.iter()
            .try_fold(1usize, |total, axis| {
                axis.checked_point_count()
                    .and_then(|n| total.checked_mul(n))
            })
            .ok_or(SweepError::TooManyPoints)?;
        let cursor = Some(vec![0; axes.len()]);
        Ok(Self {
            kind: SweepKind::Grid { axes, cursor },
        })
    }

    pub fn cycle(name: &str, values: Vec<f64>) -> Result<Self, SweepError> {
        if !is_valid_name(name) {
            return Err(SweepError::InvalidName(name.to_string()));
        }
        if values.is_empty() {
            return Err(SweepError::EmptyCycle(name.to_string()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SweepError::InvalidAxis {
                name: name.to_string(),
                reason: "cycle values must be finite".to_string(),
            });
        }
        Ok(Self {
            kind: SweepKind::Cycle {
                name: name.to_string(),
                values: values.into_iter().map(normalize).collect(),
                position: 0,
            },
        })
    }

    pub fn is_cyclic(&self) -> bool {
        matches!(self.kind, SweepKind::Cycle { .. })
    }

    /// Total tuple count for a finite sweep, `None` for a cycle.
    pub fn len_hint(&self) -> Option<usize> {
        match &self.kind {
            SweepKind::Grid { .. } => Some(self.pass_len()),
            SweepKind::Cycle { .. } => None,
        }
    }

    /// Tuples in one pass: the grid size, or the cycle list length.
    pub fn pass_len(&self) -> usize {
        match &self.kind {
            SweepKind::Grid { axes, .. } => axes
                .iter()
                .fold(1usize, |total, axis| total.saturating_mul(axis.point_count())),
            SweepKind::Cycle { values, .. } => values.len(),
        }
    }

    pub fn axis_names(&self) -> Vec<String> {
        match &self.kind {
            SweepKind::Grid { axes, .. } => axes.iter().map(|a| a.name.clone()).collect(),
            SweepKind::Cycle { name, .. } => vec![name.clone()],
        }
    }

    pub fn reset(&mut self) {
        match &mut self.kind {
            SweepKind::Grid { axes, cursor } => *cursor = Some(vec![0; axes.len()]),
            SweepKind::Cycle { position, .. } => *position = 0,
        }
    }
}

impl Iterator for ParameterSweep {
    type Item = ParameterTuple;

    fn next(&mut self) -> Option<ParameterTuple> {
        match &mut self.kind {
            SweepKind::Grid { axes, cursor } => {
                let current = cursor.take()?;
                let tuple = ParameterTuple::new(
                    axes.iter()
                        .zip(current.iter())
                        .map(|(axis, &i)| (axis.name.clone(), axis.value_at(i)))
                        .collect(),
                );
                let mut next = current;
                let mut level = axes.len();
                while level > 0 {
                    level -= 1;
                    next[level] += 1;
                    if next[level] < axes[level].point_count() {
                        *cursor = Some(next);
                        break;
                    }
                    next[level] = 0;
                }
                Some(tuple)
            }
            SweepKind::Cycle {
                name,
                values,
                position,
            } => {
                let value = values[*position];
                *position = (*position + 1) % values.len();
                Some(ParameterTuple::new(vec![(name.clone(), value)]))
            }
        }
    }
}
