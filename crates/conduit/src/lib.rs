pub mod accumulator;
pub mod agent;
pub mod context;
pub mod errors;
pub mod executor;
pub mod models;
pub mod notification;
pub mod providers;
pub mod store;
pub mod tag_parser;
pub mod token_counter;
pub mod usage;
