use serde::{Deserialize, Serialize};

use crate::consistency::Tolerance;
use crate::mapping::MappingMode;

/// Engine defaults applied where a conversion specification leaves a setting open.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Tolerance for comparing derived totals against reported totals.
    pub tolerance: Tolerance,
    /// Tolerance for comparing known subcategories against a basket before downscaling.
    pub downscale_tolerance: Tolerance,
    pub mapping_mode: MappingMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tolerance: Tolerance::default(),
            downscale_tolerance: Tolerance::relative(0.01),
            mapping_mode: MappingMode::Permissive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_should_fill_defaults() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            mapping_mode = "strict"

            [tolerance]
            relative = 0.02
            "#,
        )?;
        assert_eq!(config.mapping_mode, MappingMode::Strict);
        assert_eq!(config.tolerance, Tolerance::relative(0.02));
        assert_eq!(config.downscale_tolerance, Config::default().downscale_tolerance);
        assert_eq!(toml::from_str::<Config>("")?, Config::default());
        Ok(())
    }
}
