//! Trace identifier extraction and per-trace compilation.

mod compile;
mod extract;

pub use compile::{artifact_filename, compile_trace, write_artifact, CompiledTrace};
pub use extract::TraceIdExtractor;
