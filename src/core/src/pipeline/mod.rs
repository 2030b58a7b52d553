mod args;
mod extract;
mod invoke;

pub use extract::response_text;
pub use invoke::{ToolCall, ToolPipeline, TOO_MANY_CALLS};
