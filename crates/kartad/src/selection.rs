//! Which scenarios run in a given iteration.

use karta_core::types::{IterationOptions, TestScenario};
use rand::Rng;

/// Picks the scenarios for iteration `iteration`.
///
/// Chance-based selection takes precedence and draws exactly one scenario,
/// weighted by [`TestScenario::selection_weight`]. Exclusive mode draws one
/// member per exclusive group, cycling through members by iteration index;
/// scenarios without a group share one implicit group. Otherwise every
/// scenario runs.
pub fn select_scenarios<'a, R: Rng + ?Sized>(
    scenarios: &'a [TestScenario],
    options: &IterationOptions,
    iteration: u64,
    rng: &mut R,
) -> Vec<&'a TestScenario> {
    if scenarios.is_empty() {
        return Vec::new();
    }
    if options.chance_based {
        return vec![weighted_pick(scenarios, rng)];
    }
    if options.exclusive_per_iteration {
        return exclusive_groups(scenarios)
            .into_iter()
            .filter_map(|members| {
                let slot = (iteration % members.len() as u64) as usize;
                members.get(slot).copied()
            })
            .collect();
    }
    scenarios.iter().collect()
}

fn weighted_pick<'a, R: Rng + ?Sized>(scenarios: &'a [TestScenario], rng: &mut R) -> &'a TestScenario {
    let total: f64 = scenarios.iter().map(TestScenario::selection_weight).sum();
    if total.is_nan() || total <= 0.0 {
        return &scenarios[rng.gen_range(0..scenarios.len())];
    }
    let mut draw = rng.gen_range(0.0..total);
    for scenario in scenarios {
        let weight = scenario.selection_weight();
        if draw < weight {
            return scenario;
        }
        draw -= weight;
    }
    // rounding can leave the draw just past the last positive weight
    scenarios
        .iter()
        .rev()
        .find(|scenario| scenario.selection_weight() > 0.0)
        .unwrap_or(&scenarios[scenarios.len() - 1])
}

/// Groups in order of first appearance.
fn exclusive_groups(scenarios: &[TestScenario]) -> Vec<Vec<&TestScenario>> {
    let mut keys: Vec<Option<&str>> = Vec::new();
    let mut groups: Vec<Vec<&TestScenario>> = Vec::new();
    for scenario in scenarios {
        let key = scenario.exclusive_group.as_deref();
        match keys.iter().position(|existing| *existing == key) {
            Some(index) => groups[index].push(scenario),
            None => {
                keys.push(key);
                groups.push(vec![scenario]);
            }
        }
    }
    groups
}
