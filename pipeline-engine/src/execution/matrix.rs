// Matrix Expansion
// Expands a job's matrix axes into ordered concrete parameter bindings

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::fmt;

/// Matrix declaration of a job: named axes plus include/exclude adjustments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Axis name to ordered values, in declaration order
    pub axes: IndexMap<String, Vec<String>>,
    /// Combinations removed from the cross product (partial matches allowed)
    #[serde(default)]
    pub exclude: Vec<IndexMap<String, String>>,
    /// Combinations merged into, or appended to, the cross product
    #[serde(default)]
    pub include: Vec<IndexMap<String, String>>,
}

impl MatrixSpec {
    pub fn builder() -> MatrixBuilder {
        MatrixBuilder::new()
    }

    /// True when the spec declares nothing at all
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty() && self.include.is_empty()
    }

    /// Every name a binding may carry: declared axes, then keys added by `include`
    pub fn axis_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.axes.keys().cloned().collect();
        for entry in &self.include {
            for key in entry.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
        names
    }

    /// Axes declared with zero values
    pub fn empty_axes(&self) -> Vec<&str> {
        self.axes
            .iter()
            .filter(|(_, values)| values.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// One concrete combination of matrix values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixBinding {
    index: usize,
    values: IndexMap<String, String>,
}

impl MatrixBinding {
    pub fn new(index: usize, values: IndexMap<String, String>) -> Self {
        Self { index, values }
    }

    /// Position of this binding in the expansion
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.values.get(axis).map(String::as_str)
    }

    pub fn values(&self) -> &IndexMap<String, String> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Environment variables for the binding: `MATRIX_<AXIS>=value`
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(axis, value)| {
                let name: String = axis
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                (format!("MATRIX_{}", name), value.clone())
            })
            .collect()
    }
}

impl fmt::Display for MatrixBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Matrix expander for job strategies
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand a matrix spec into ordered bindings.
    ///
    /// The cross product varies the last declared axis fastest. `exclude`
    /// is applied to the cross product, then `include` entries are merged
    /// into every combination whose declared axes they agree with, or
    /// appended when they agree with none. An axis with no values yields
    /// no bindings at all.
    pub fn expand(spec: &MatrixSpec) -> Vec<MatrixBinding> {
        if !spec.empty_axes().is_empty() {
            return Vec::new();
        }

        let mut combos: Vec<IndexMap<String, String>> = if spec.axes.is_empty() {
            if spec.include.is_empty() {
                vec![IndexMap::new()]
            } else {
                Vec::new()
            }
        } else {
            Self::cross_product(&spec.axes)
        };

        combos.retain(|combo| {
            !spec.exclude.iter().any(|partial| {
                !partial.is_empty()
                    && partial
                        .iter()
                        .all(|(axis, value)| combo.get(axis) == Some(value))
            })
        });

        for entry in &spec.include {
            let mut merged = false;

            for combo in combos.iter_mut() {
                let agrees = entry
                    .iter()
                    .filter(|(axis, _)| spec.axes.contains_key(*axis))
                    .all(|(axis, value)| combo.get(axis) == Some(value));

                if agrees && !spec.axes.is_empty() {
                    for (key, value) in entry {
                        if !spec.axes.contains_key(key) {
                            combo.insert(key.clone(), value.clone());
                        }
                    }
                    merged = true;
                }
            }

            if !merged {
                combos.push(entry.clone());
            }
        }

        combos
            .into_iter()
            .enumerate()
            .map(|(index, values)| MatrixBinding::new(index, values))
            .collect()
    }

    /// Number of combinations the cross product alone would produce
    pub fn cross_product_size(spec: &MatrixSpec) -> usize {
        spec.axes.values().map(Vec::len).product()
    }

    fn cross_product(axes: &IndexMap<String, Vec<String>>) -> Vec<IndexMap<String, String>> {
        let mut combos = vec![IndexMap::new()];

        for (axis, values) in axes {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(axis.clone(), value.clone());
                    next.push(extended);
                }
            }
            combos = next;
        }

        combos
    }
}

/// Builder for creating matrix specs programmatically
#[derive(Debug, Default)]
pub struct MatrixBuilder {
    spec: MatrixSpec,
}

impl MatrixBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an axis with its ordered values
    pub fn axis<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.spec
            .axes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Exclude combinations matching every given pair
    pub fn exclude<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.spec.exclude.push(collect_pairs(pairs));
        self
    }

    /// Include an extra combination (or extra keys for matching combinations)
    pub fn include<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.spec.include.push(collect_pairs(pairs));
        self
    }

    pub fn build(self) -> MatrixSpec {
        self.spec
    }
}

fn collect_pairs<I, K, V>(pairs: I) -> IndexMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
