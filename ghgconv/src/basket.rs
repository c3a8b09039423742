//! Gas baskets (sums of gases in CO2 equivalents) and GWP relabelling of entities.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::{debug, info, warn};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::aggregate::{dependency_order, Accumulator};
use crate::consistency::{reconcile, Tolerance};
use crate::entity::{Entity, Gwp, KNOWN_GASES};
use crate::error::{ConversionError, Result};
use crate::observation::{Dimension, Key, Merge, ObservationTable, Value};
use crate::pipeline::Stage;
use crate::report::{Conflict, Report, Skipped};
use crate::selection::{CompiledSelection, Selection};
use crate::units::{co2eq_factor, BASKET_UNIT};

/// `entity = sum(contents)`, e.g. `KYOTOGHG (AR5GWP100) = CO2 + CH4 + N2O + FGASES (AR5GWP100)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketDefinition {
    pub entity: String,
    pub contents: NonEmpty<String>,
    #[serde(default)]
    pub filter: Option<Selection>,
}

impl BasketDefinition {
    pub fn new(entity: &str, contents: NonEmpty<String>) -> Self {
        Self {
            entity: entity.into(),
            contents,
            filter: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedBasket {
    name: String,
    gwp: Option<Gwp>,
    contents: BTreeSet<String>,
    filter: CompiledSelection,
}

/// Copies the values of entities reported under `source_gwp` to the same entities labelled
/// with each of `target_gwps`. The numbers are not converted: groups such as HFCS are
/// reported without a per-species breakdown, so relabelling is the only possible conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GwpReplication {
    pub entities: Vec<String>,
    pub source_gwp: Gwp,
    pub target_gwps: Vec<Gwp>,
}

impl GwpReplication {
    fn sources(&self) -> BTreeSet<String> {
        self.entities
            .iter()
            .map(|name| Entity::new(name, Some(self.source_gwp)).to_string())
            .collect()
    }

    fn targets(&self) -> BTreeSet<String> {
        self.entities
            .iter()
            .cartesian_product(self.target_gwps.iter().filter(|gwp| **gwp != self.source_gwp))
            .map(|(name, gwp)| Entity::new(name, Some(*gwp)).to_string())
            .collect()
    }
}

fn borrowed(sets: &[BTreeSet<String>]) -> Vec<BTreeSet<&str>> {
    sets.iter()
        .map(|set| set.iter().map(String::as_str).collect())
        .collect()
}

#[derive(Debug, Clone)]
enum Step {
    Basket(ResolvedBasket),
    Replication(GwpReplication),
}

impl Step {
    fn produces(&self) -> BTreeSet<String> {
        match self {
            Step::Basket(basket) => BTreeSet::from([basket.name.clone()]),
            Step::Replication(rule) => rule.targets(),
        }
    }

    fn consumes(&self) -> BTreeSet<String> {
        match self {
            Step::Basket(basket) => basket.contents.clone(),
            Step::Replication(rule) => rule.sources(),
        }
    }

    fn label(&self) -> String {
        match self {
            Step::Basket(basket) => basket.name.clone(),
            Step::Replication(rule) => format!(
                "[{}] relabelled from {}",
                rule.entities.join(", "),
                rule.source_gwp
            ),
        }
    }
}

/// Builds gas baskets and relabels entities under other GWP conventions. Baskets may contain
/// relabelled entities and relabelling may copy computed baskets, so both kinds of step run in
/// one stable topological order.
#[derive(Debug, Clone)]
pub struct GasBasketBuilder {
    steps: Vec<Step>,
    tolerance: Tolerance,
}

impl GasBasketBuilder {
    /// A constituent is defined if it is a known gas (with or without GWP label), a basket,
    /// the output of a relabelling, or listed in `extra_entities`. A labelled constituent must
    /// carry the GWP convention of its basket.
    pub fn new(
        definitions: &[BasketDefinition],
        replications: &[GwpReplication],
        extra_entities: &[String],
        tolerance: Tolerance,
    ) -> Result<Self> {
        for rule in replications {
            for entity in &rule.entities {
                let parsed: Entity = entity.parse()?;
                if parsed.gwp.is_some() {
                    return Err(ConversionError::InvalidEntity(format!(
                        "{entity} (replication entities are given without GWP label)"
                    )));
                }
            }
        }
        let defined: BTreeSet<String> = extra_entities
            .iter()
            .cloned()
            .chain(definitions.iter().map(|d| d.entity.clone()))
            .chain(replications.iter().flat_map(GwpReplication::targets))
            .collect();

        let mut steps = Vec::with_capacity(definitions.len() + replications.len());
        for definition in definitions {
            let basket: Entity = definition.entity.parse()?;
            for constituent in definition.contents.iter() {
                if *constituent == definition.entity {
                    return Err(ConversionError::BasketSelfReference(constituent.clone()));
                }
                let parsed: Entity = constituent.parse()?;
                if parsed.gwp.is_some() && parsed.gwp != basket.gwp {
                    return Err(ConversionError::GwpMismatch {
                        basket: definition.entity.clone(),
                        constituent: constituent.clone(),
                    });
                }
                if !(defined.contains(constituent) || KNOWN_GASES.contains(&parsed.name.as_str()))
                {
                    return Err(ConversionError::UndefinedConstituent {
                        basket: definition.entity.clone(),
                        constituent: constituent.clone(),
                    });
                }
            }
            let filter = match &definition.filter {
                Some(selection) => selection.compile()?,
                None => CompiledSelection::default(),
            };
            steps.push(Step::Basket(ResolvedBasket {
                name: definition.entity.clone(),
                gwp: basket.gwp,
                contents: definition.contents.iter().cloned().collect(),
                filter,
            }));
        }
        steps.extend(replications.iter().cloned().map(Step::Replication));

        let produces = steps.iter().map(Step::produces).collect_vec();
        let consumes = steps.iter().map(Step::consumes).collect_vec();
        let order = dependency_order(&borrowed(&produces), &borrowed(&consumes)).map_err(|cycle| {
            ConversionError::BasketCycle(cycle.into_iter().map(|i| steps[i].label()).collect())
        })?;
        let mut slots = steps.into_iter().map(Some).collect_vec();
        let steps = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect_vec();
        debug!(
            "Gas basket order: {}",
            steps.iter().map(Step::label).join(", ")
        );
        Ok(Self { steps, tolerance })
    }

    fn build(&self, basket: &ResolvedBasket, table: &mut ObservationTable, report: &mut Report) {
        let mut groups: BTreeMap<Key, Accumulator> = BTreeMap::new();
        for (key, value) in table.iter() {
            if !basket.contents.contains(&key.entity) || !basket.filter.matches(key) {
                continue;
            }
            let value = match value {
                Value::Number(n) => match co2eq_factor(&key.unit, basket.gwp) {
                    // Skip the multiplication so CO2-equivalent inputs are summed unchanged
                    Ok(factor) if factor == 1.0 => Value::Number(*n),
                    Ok(factor) => Value::Number(n * factor),
                    Err(reason) => {
                        warn!("Skipping {key} for basket {}: {reason}", basket.name);
                        report.skipped.push(Skipped {
                            key: key.clone(),
                            stage: self.name().into(),
                            reason,
                        });
                        continue;
                    }
                },
                other => *other,
            };
            groups
                .entry(
                    key.with_entity(&basket.name)
                        .with(Dimension::Unit, BASKET_UNIT),
                )
                .or_default()
                .add(&value);
        }
        let produced = groups.len();
        for (basket_key, acc) in groups {
            reconcile(
                table,
                basket_key,
                acc.finish(1),
                &self.tolerance,
                self.name(),
                report,
            );
        }
        debug!(
            "Basket {} = {}: {produced} groups",
            basket.name,
            basket.contents.iter().join(" + ")
        );
    }

    fn replicate(&self, rule: &GwpReplication, table: &mut ObservationTable, report: &mut Report) {
        let sources: BTreeMap<String, Entity> = rule
            .entities
            .iter()
            .map(|name| {
                let entity = Entity::new(name, Some(rule.source_gwp));
                (entity.to_string(), entity)
            })
            .collect();
        let copies = table
            .iter()
            .filter_map(|(key, value)| sources.get(&key.entity).map(|e| (key, value, e)))
            .flat_map(|(key, value, entity)| {
                rule.target_gwps
                    .iter()
                    .filter(|gwp| **gwp != rule.source_gwp)
                    .map(move |gwp| (key.with_entity(&entity.with_gwp(*gwp).to_string()), *value))
            })
            .collect_vec();
        let copied = copies.len();
        for (key, value) in copies {
            if let Merge::Conflict { existing, incoming } = table.merge(key.clone(), value) {
                warn!("Not replacing reported {existing} at {key} with relabelled {incoming}");
                report.conflicts.push(Conflict {
                    key,
                    stage: self.name().into(),
                    kept: existing,
                    discarded: incoming,
                });
            }
        }
        debug!(
            "Relabelled {copied} values of [{}] from {} to [{}]",
            rule.entities.join(", "),
            rule.source_gwp,
            rule.target_gwps.iter().join(", ")
        );
    }
}

impl Stage for GasBasketBuilder {
    fn name(&self) -> &'static str {
        "gas baskets"
    }

    fn apply(&self, table: &mut ObservationTable, report: &mut Report) -> Result<()> {
        for step in &self.steps {
            match step {
                Step::Basket(basket) => self.build(basket, table, report),
                Step::Replication(rule) => self.replicate(rule, table, report),
            }
        }
        info!("Ran {} gas basket and relabelling steps", self.steps.len());
        Ok(())
    }
}
