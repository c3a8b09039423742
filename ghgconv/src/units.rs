//! Parsing of emission units and normalization to CO2 equivalents for basket sums.

use std::str::FromStr;

use crate::entity::{gwp_factor, Gwp};

/// Species tokens that already denote CO2 equivalents.
const CO2_EQUIVALENT: &[&str] = &["CO2", "CO2eq", "CO2e"];

/// Unit that basket sums are expressed in.
pub const BASKET_UNIT: &str = "Gg CO2 / yr";

/// A mass-flow unit of the form `<prefix> <species> [/ yr]`, e.g. `Gg CH4 / yr`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionUnit {
    /// Scale to gigagrams.
    pub scale: f64,
    pub species: String,
}

impl FromStr for EmissionUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mass, per) = match s.split_once('/') {
            Some((mass, per)) => (mass.trim(), Some(per.trim())),
            None => (s.trim(), None),
        };
        if let Some(other) = per.filter(|per| !matches!(*per, "yr" | "year" | "a")) {
            return Err(format!("unsupported time unit '{other}' in '{s}'"));
        }
        let mut tokens = mass.split_whitespace();
        let (Some(prefix), Some(species), None) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(format!("expected '<prefix> <species>' in '{s}'"));
        };
        let scale = match prefix {
            "t" => 1e-3,
            "kt" | "Gg" => 1.0,
            "Mt" | "Tg" => 1e3,
            other => return Err(format!("unsupported mass prefix '{other}' in '{s}'")),
        };
        Ok(Self {
            scale,
            species: species.to_string(),
        })
    }
}

impl EmissionUnit {
    pub fn is_co2_equivalent(&self) -> bool {
        CO2_EQUIVALENT.contains(&self.species.as_str())
    }
}

/// Factor converting a value in `unit` to [`BASKET_UNIT`] under `gwp`.
///
/// CO2-equivalent units are only rescaled by their mass prefix, so a `Gg CO2 / yr` input has
/// factor exactly `1.0`. Single-species mass units need a GWP; multi-species groups cannot be
/// converted.
pub fn co2eq_factor(unit: &str, gwp: Option<Gwp>) -> Result<f64, String> {
    let parsed: EmissionUnit = unit.parse()?;
    if parsed.is_co2_equivalent() {
        return Ok(parsed.scale);
    }
    let gwp = gwp.ok_or_else(|| {
        format!("'{unit}' is a mass unit but the basket carries no GWP convention")
    })?;
    gwp_factor(&parsed.species, gwp)
        .map(|factor| parsed.scale * factor)
        .ok_or_else(|| format!("no {gwp} factor for species '{}'", parsed.species))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_should_parse_common_spellings() {
        let u: EmissionUnit = "Gg CO2 / yr".parse().unwrap();
        assert_eq!(u.scale, 1.0);
        assert!(u.is_co2_equivalent());
        let u: EmissionUnit = "kt CH4/year".parse().unwrap();
        assert_eq!(u.species, "CH4");
        let u: EmissionUnit = "Mt CO2eq".parse().unwrap();
        assert_eq!(u.scale, 1e3);
        assert!("Gg CO2 / day".parse::<EmissionUnit>().is_err());
        assert!("CO2".parse::<EmissionUnit>().is_err());
        assert!("Pg CO2 / yr".parse::<EmissionUnit>().is_err());
    }

    #[test]
    fn co2eq_factor_uses_gwp_for_mass_units() {
        assert_eq!(co2eq_factor("Gg CO2 / yr", None), Ok(1.0));
        assert_eq!(co2eq_factor("Mt CO2 / yr", None), Ok(1000.0));
        assert_eq!(co2eq_factor("Gg CH4 / yr", Some(Gwp::AR5GWP100)), Ok(28.0));
        assert_eq!(co2eq_factor("Mt N2O / yr", Some(Gwp::SARGWP100)), Ok(310_000.0));
        assert!(co2eq_factor("Gg CH4 / yr", None).is_err());
        assert!(co2eq_factor("Gg HFCS / yr", Some(Gwp::AR5GWP100)).is_err());
    }
}
