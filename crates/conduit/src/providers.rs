pub mod anthropic;
pub mod base;
pub mod configs;
pub mod factory;
pub mod google;
pub mod openai;
pub mod retry;
pub mod sse;
pub mod utils;
pub mod xai;

#[cfg(test)]
pub mod mock;
