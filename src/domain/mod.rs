//! Core data model: missions, epochs, work units, backlog, reviews.

mod context;
mod mission;
mod review;
mod unit;

pub use context::{ContextItem, Reflection};
pub use mission::{Epoch, Mission, MissionStatus, StopReason};
pub use review::ReviewRecord;
pub use unit::{BacklogItem, UnitState, WorkUnit};

use uuid::Uuid;

/// 12-hex identifier shared by every persisted record.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_short_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
