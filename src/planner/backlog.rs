use async_trait::async_trait;

use crate::domain::WorkUnit;
use crate::error::Result;
use crate::store::Store;

use super::{PlanContext, Planner};

/// Mechanical planner: promotes the highest-scoring backlog items into
/// work units, one per item. Stands in for the LLM planner when running
/// against a curated backlog.
pub struct BacklogPlanner {
    store: Store,
}

impl BacklogPlanner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Planner for BacklogPlanner {
    async fn plan_epoch(&self, ctx: &PlanContext) -> Result<Vec<WorkUnit>> {
        let mut items = self.store.list_backlog().await?;
        items.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let units = items
            .into_iter()
            .take(ctx.max_units)
            .map(|item| {
                WorkUnit::new(&ctx.mission_id, &ctx.epoch_id, &item.description)
                    .with_files_hint(item.files_hint.clone())
            })
            .collect();

        Ok(units)
    }
}
