//! Agent prompt templates.

mod render;

pub use render::{DEFAULT_TEMPLATE, PromptContext, PromptRenderer};
