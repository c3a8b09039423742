//! Gas and gas-basket entities, optionally tagged with a GWP convention, e.g.
//! `HFCS (AR5GWP100)`.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumIter, EnumString};

use crate::error::{ConversionError, Result};

/// Global warming potential conventions (100-year horizon) of successive IPCC assessment
/// reports.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    StrumDisplay,
    EnumIter,
)]
pub enum Gwp {
    SARGWP100,
    AR4GWP100,
    AR5GWP100,
    AR6GWP100,
}

/// Individual gases and gas groups reported by inventories. Used to decide whether a basket
/// constituent is defined.
pub const KNOWN_GASES: &[&str] = &[
    "CO2", "CH4", "N2O", "SF6", "NF3", "HFCS", "PFCS", "FGASES", "UnspMixOfHFCs",
    "UnspMixOfPFCs", "KYOTOGHG", "CO", "NOX", "NMVOC", "SO2", "NH3",
];

/// 100-year GWP of a single species under a convention. Multi-species groups (HFCS, PFCS)
/// have no factor: they are only ever reported in CO2 equivalents.
pub fn gwp_factor(species: &str, gwp: Gwp) -> Option<f64> {
    let factor = match (species, gwp) {
        ("CO2", _) => 1.0,
        ("CH4", Gwp::SARGWP100) => 21.0,
        ("CH4", Gwp::AR4GWP100) => 25.0,
        ("CH4", Gwp::AR5GWP100) => 28.0,
        ("CH4", Gwp::AR6GWP100) => 27.9,
        ("N2O", Gwp::SARGWP100) => 310.0,
        ("N2O", Gwp::AR4GWP100) => 298.0,
        ("N2O", Gwp::AR5GWP100) => 265.0,
        ("N2O", Gwp::AR6GWP100) => 273.0,
        ("SF6", Gwp::SARGWP100) => 23900.0,
        ("SF6", Gwp::AR4GWP100) => 22800.0,
        ("SF6", Gwp::AR5GWP100) => 23500.0,
        ("SF6", Gwp::AR6GWP100) => 25200.0,
        ("NF3", Gwp::AR4GWP100) => 17200.0,
        ("NF3", Gwp::AR5GWP100) => 16100.0,
        ("NF3", Gwp::AR6GWP100) => 17400.0,
        _ => return None,
    };
    Some(factor)
}

/// A parsed entity name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    pub name: String,
    pub gwp: Option<Gwp>,
}

impl Entity {
    pub fn new(name: &str, gwp: Option<Gwp>) -> Self {
        Self {
            name: name.into(),
            gwp,
        }
    }

    /// The same entity relabelled with another GWP convention.
    pub fn with_gwp(&self, gwp: Gwp) -> Self {
        Self::new(&self.name, Some(gwp))
    }
}

impl FromStr for Entity {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('(') {
            None if !s.is_empty() && !s.contains(')') => Ok(Entity::new(s, None)),
            None => Err(ConversionError::InvalidEntity(s.into())),
            Some((name, rest)) => {
                let name = name.trim();
                let gwp = rest
                    .strip_suffix(')')
                    .ok_or_else(|| ConversionError::InvalidEntity(s.into()))?
                    .trim();
                if name.is_empty() {
                    return Err(ConversionError::InvalidEntity(s.into()));
                }
                let gwp =
                    Gwp::from_str(gwp).map_err(|_| ConversionError::UnknownGwp(gwp.into()))?;
                Ok(Entity::new(name, Some(gwp)))
            }
        }
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.gwp {
            Some(gwp) => write!(f, "{} ({gwp})", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
