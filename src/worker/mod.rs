//! Worker seam: the envelope wire contract, the pluggable backend trait,
//! and the local subprocess backend.

mod backend;
mod envelope;
mod prompt;

pub use backend::{LocalBackend, WorkerBackend, WorkerRequest};
pub use envelope::{
    ErrorKind, MC_RESULT_MARKER, ResultEnvelope, TokenUsage, extract_json_object, parse_envelope,
};
pub use prompt::render_worker_prompt;
