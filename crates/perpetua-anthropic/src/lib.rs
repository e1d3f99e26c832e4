//! Anthropic messages-API driver for Perpetua.

mod driver;

pub use driver::AnthropicDriver;
