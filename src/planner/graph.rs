//! Kahn-style topological layering over unit dependencies.

use std::collections::{HashMap, HashSet};

use crate::domain::WorkUnit;
use crate::error::{ForemanError, Result};

/// Order units into dispatch layers: every unit appears in a layer after
/// all of its dependencies. Dependencies on ids outside the plan are
/// ignored (they refer to previously completed units). A cycle fails the
/// whole plan so the controller can request a replan.
pub fn topo_layers(units: &[WorkUnit]) -> Result<Vec<Vec<String>>> {
    let ids: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();

    // Unmet in-plan dependency counts plus reverse edges.
    let mut deps_of: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut dependents_of: HashMap<&str, Vec<&str>> = HashMap::new();
    for unit in units {
        let dep_ids: HashSet<&str> = unit
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| ids.contains(d))
            .collect();
        for dep in &dep_ids {
            dependents_of.entry(dep).or_default().push(&unit.id);
        }
        deps_of.insert(&unit.id, dep_ids);
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    while placed.len() < units.len() {
        // Preserve plan order inside each layer.
        let ready: Vec<&str> = units
            .iter()
            .map(|u| u.id.as_str())
            .filter(|id| !placed.contains(id))
            .filter(|id| deps_of[id].iter().all(|d| placed.contains(d)))
            .collect();

        if ready.is_empty() {
            let stuck: Vec<&str> = units
                .iter()
                .map(|u| u.id.as_str())
                .filter(|id| !placed.contains(id))
                .collect();
            return Err(ForemanError::PlanValidation(format!(
                "dependency cycle among units: {}",
                stuck.join(", ")
            )));
        }

        for id in &ready {
            placed.insert(id);
        }
        layers.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, deps: &[&str]) -> WorkUnit {
        let mut u = WorkUnit::new("m", "e", format!("unit {}", id));
        u.id = id.to_string();
        u.depends_on = deps.iter().map(|d| d.to_string()).collect();
        u
    }

    #[test]
    fn independent_units_form_one_layer() {
        let units = vec![unit("a", &[]), unit("b", &[]), unit("c", &[])];
        let layers = topo_layers(&units).unwrap();
        assert_eq!(layers, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn chain_forms_one_layer_each() {
        let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &["b"])];
        let layers = topo_layers(&units).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["a"]);
        assert_eq!(layers[1], vec!["b"]);
        assert_eq!(layers[2], vec!["c"]);
    }

    #[test]
    fn diamond_resolves_in_three_layers() {
        let units = vec![
            unit("a", &[]),
            unit("b", &["a"]),
            unit("c", &["a"]),
            unit("d", &["b", "c"]),
        ];
        let layers = topo_layers(&units).unwrap();
        assert_eq!(layers[0], vec!["a"]);
        assert_eq!(layers[1], vec!["b", "c"]);
        assert_eq!(layers[2], vec!["d"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let units = vec![unit("a", &["b"]), unit("b", &["a"])];
        let err = topo_layers(&units).unwrap_err();
        assert!(matches!(err, ForemanError::PlanValidation(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn dependency_outside_plan_is_ignored() {
        let units = vec![unit("a", &["completed-long-ago"])];
        let layers = topo_layers(&units).unwrap();
        assert_eq!(layers, vec![vec!["a"]]);
    }
}
