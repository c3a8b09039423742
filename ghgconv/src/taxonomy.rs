//! Category taxonomies and their implicit dot-separated hierarchy.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named set of category codes, e.g. `IPCC2006_PRIMAP`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub name: String,
    #[serde(default)]
    pub codes: BTreeSet<String>,
}

impl Taxonomy {
    pub fn new<I, S>(name: &str, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    /// Direct children of `code` that are members of this taxonomy: `1.A.1` and `1.A.2` for
    /// `1.A`, but not `1.A.1.a`.
    pub fn children<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.codes
            .iter()
            .map(String::as_str)
            .filter(move |candidate| parent(candidate) == Some(code))
    }
}

/// The parent code implied by the dotted notation, if any. Codes introduced for aggregates no
/// official taxonomy defines (`M.AG`, `M.0.EL`) hang off no official code.
pub fn parent(code: &str) -> Option<&str> {
    code.rsplit_once('.')
        .map(|(head, _)| head)
        .filter(|head| !head.is_empty() && *head != "M")
}
