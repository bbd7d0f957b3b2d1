//! Post-promotion diff review: fire-and-forget quality scoring.

mod reviewer;

pub use reviewer::{DiffReviewer, REVIEW_RESULT_MARKER, parse_review_output};
