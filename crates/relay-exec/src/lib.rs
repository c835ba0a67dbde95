//! Supervised execution of the `codex exec --json` tool.
//!
//! - [`tool_events`] decodes the tool's heterogeneous JSON lines
//! - [`normalizer`] maps them onto the progress vocabulary
//! - [`orchestrator`] spawns, streams, times out and cancels a run
//! - [`terminate`] kills a run's whole process tree

pub mod discovery;
pub mod invocation;
pub mod normalizer;
pub mod orchestrator;
pub mod result;
pub mod terminate;
pub mod tool_events;

pub use discovery::locate_tool;
pub use invocation::{build_args, InvocationMode};
pub use normalizer::{normalize, normalize_event};
pub use orchestrator::{run_new, run_resumed, LineCallback, RunOptions, RunOutcome};
pub use result::{parse_output, ParsedResult, SUMMARY_LIMIT};
pub use tool_events::{ToolEvent, ToolItem};
