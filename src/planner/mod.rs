//! Planning seam: the trait the controller consumes, DAG validation, and
//! file-overlap rules. The LLM planner itself lives outside the core; the
//! shipped `BacklogPlanner` mechanically promotes backlog items.

mod backlog;
mod graph;
mod overlap;

pub use backlog::BacklogPlanner;
pub use graph::topo_layers;
pub use overlap::{files_overlap, overlap_ratio, partition_layer_by_overlap, paths_overlap};

use async_trait::async_trait;

use crate::domain::WorkUnit;
use crate::error::Result;

/// Everything the planner sees when asked for the next epoch.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub mission_id: String,
    pub epoch_id: String,
    pub epoch_ordinal: u32,
    pub objective: String,
    pub max_units: usize,
    /// Recent reflection summaries, newest first.
    pub reflections: Vec<String>,
    /// Descriptions of units dropped as stale since the last plan.
    pub stale_context: Vec<String>,
    /// Set when the previous plan was rejected (cycle or ambition gate).
    pub rejection_reason: Option<String>,
}

/// Produces ordered work units with dependency graph and acceptance
/// criteria; replans on stall or ambition rejection.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan_epoch(&self, ctx: &PlanContext) -> Result<Vec<WorkUnit>>;

    /// Score plan scope on a 0-10 scale for the ambition gate. LLM
    /// planners may self-report; this heuristic rewards breadth of files,
    /// acceptance-criteria coverage, and unit count.
    fn ambition_score(&self, units: &[WorkUnit]) -> f64 {
        if units.is_empty() {
            return 0.0;
        }

        let unit_score = (units.len() as f64).min(4.0);

        let distinct_files: std::collections::HashSet<&str> = units
            .iter()
            .flat_map(|u| u.files_hint.iter().map(String::as_str))
            .collect();
        let file_score = (distinct_files.len() as f64 / 2.0).min(3.0);

        let with_criteria = units
            .iter()
            .filter(|u| !u.acceptance_criteria.is_empty())
            .count();
        let criteria_score = 3.0 * with_criteria as f64 / units.len() as f64;

        (unit_score + file_score + criteria_score).min(10.0)
    }
}
