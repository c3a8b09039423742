//! Row predicates over observation dimensions, used by removal filters and to restrict which
//! rows aggregation and downscale rules apply to.

use std::collections::BTreeMap;
use std::fmt::Display;

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, Result};
use crate::observation::{Dimension, Key};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Exact,
    /// Matches a value and, for dotted codes, its whole subtree (`1.A` matches `1.A.2`).
    Startswith,
    Regex,
}

/// A single configured value. Years may be given as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Integer(i64),
}

impl Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Text(s) => write!(f, "{s}"),
            Scalar::Integer(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.into())
    }
}

/// The values one dimension may take. Values are alternatives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matcher {
    One(Scalar),
    Many(Vec<Scalar>),
    Detailed {
        values: Vec<Scalar>,
        #[serde(default)]
        match_type: MatchType,
    },
}

impl Matcher {
    fn parts(&self) -> (Vec<String>, MatchType) {
        match self {
            Matcher::One(v) => (vec![v.to_string()], MatchType::Exact),
            Matcher::Many(vs) => (vs.iter().map(Scalar::to_string).collect(), MatchType::Exact),
            Matcher::Detailed { values, match_type } => (
                values.iter().map(Scalar::to_string).collect(),
                *match_type,
            ),
        }
    }
}

/// A conjunction of per-dimension matchers, e.g. `{"category": ["M.MEMO", "M.BK"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Selection(pub BTreeMap<Dimension, Matcher>);

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper to add an exact-match dimension.
    pub fn with<I, S>(mut self, dimension: Dimension, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values
            .into_iter()
            .map(|v| Scalar::Text(v.into()))
            .collect_vec();
        self.0.insert(dimension, Matcher::Many(values));
        self
    }

    pub fn compile(&self) -> Result<CompiledSelection> {
        let predicates = self
            .0
            .iter()
            .map(|(dimension, matcher)| {
                let (values, match_type) = matcher.parts();
                let patterns = values
                    .into_iter()
                    .map(|value| Pattern::new(value, match_type))
                    .collect::<Result<Vec<_>>>()?;
                Ok((*dimension, patterns))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledSelection { predicates })
    }
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Startswith(String),
    Regex(Regex),
}

impl Pattern {
    fn new(value: String, match_type: MatchType) -> Result<Self> {
        Ok(match match_type {
            MatchType::Exact => Pattern::Exact(value),
            MatchType::Startswith => Pattern::Startswith(value),
            MatchType::Regex => Pattern::Regex(Regex::new(&format!("^(?:{value})$")).map_err(
                |source| ConversionError::InvalidRegex {
                    pattern: value.clone(),
                    source,
                },
            )?),
        })
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Pattern::Exact(v) => candidate == v,
            Pattern::Startswith(v) => candidate.starts_with(v.as_str()),
            Pattern::Regex(re) => re.is_match(candidate),
        }
    }
}

/// A [`Selection`] with its regexes compiled.
#[derive(Debug, Clone, Default)]
pub struct CompiledSelection {
    predicates: Vec<(Dimension, Vec<Pattern>)>,
}

impl CompiledSelection {
    /// An empty selection matches every row.
    pub fn matches(&self, key: &Key) -> bool {
        self.predicates.iter().all(|(dimension, patterns)| {
            let candidate = key.get(*dimension);
            patterns.iter().any(|p| p.matches(&candidate))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::observation::tests::key;

    use super::*;

    fn compile(json: &str) -> CompiledSelection {
        serde_json::from_str::<Selection>(json)
            .unwrap()
            .compile()
            .unwrap()
    }

    #[test]
    fn exact_values_are_alternatives() {
        let sel = compile(r#"{"category": ["M.MEMO", "M.BK"]}"#);
        assert!(sel.matches(&key("M.MEMO", "CO2", 2000)));
        assert!(sel.matches(&key("M.BK", "CO2", 2000)));
        assert!(!sel.matches(&key("M.BK.M", "CO2", 2000)));
    }

    #[test]
    fn dimensions_are_conjunctive() {
        let sel = compile(r#"{"category": "1.A", "entity": "CH4", "time": 2000}"#);
        assert!(sel.matches(&key("1.A", "CH4", 2000)));
        assert!(!sel.matches(&key("1.A", "CH4", 2001)));
        assert!(!sel.matches(&key("1.A", "CO2", 2000)));
    }

    #[test]
    fn startswith_and_regex() {
        let sel = compile(r#"{"category": {"values": ["M.MEMO"], "match_type": "startswith"}}"#);
        assert!(sel.matches(&key("M.MEMO.AVI", "CO2", 2000)));
        assert!(!sel.matches(&key("1.A", "CO2", 2000)));

        let sel = compile(r#"{"entity": {"values": ["HFC.*"], "match_type": "regex"}}"#);
        assert!(sel.matches(&key("1.A", "HFCS (AR5GWP100)", 2000)));
        // Regexes are anchored
        assert!(!sel.matches(&key("1.A", "XHFCS", 2000)));
    }

    #[test]
    fn invalid_regex_is_a_configuration_error() {
        let sel: Selection =
            serde_json::from_str(r#"{"entity": {"values": ["("], "match_type": "regex"}}"#)
                .unwrap();
        assert!(matches!(
            sel.compile(),
            Err(ConversionError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn empty_selection_matches_everything() {
        let sel = Selection::new().compile().unwrap();
        assert!(sel.matches(&key("1", "CO2", 1990)));
    }

    #[test]
    fn builder_matches_json_form() {
        let built = Selection::new().with(Dimension::Entity, ["CO2"]);
        let parsed: Selection = serde_json::from_str(r#"{"entity": ["CO2"]}"#).unwrap();
        assert_eq!(built, parsed);
    }
}
