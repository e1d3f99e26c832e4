//! OpenAI-compatible drivers for Perpetua.
//!
//! One driver covers api.openai.com and every OpenAI-compatible proxy the
//! router can configure with a base URL.

mod driver;

pub use driver::OpenAiDriver;
