pub mod aggregator;
pub mod config;
pub mod error;
pub mod filter;
pub mod geo;
pub mod grid;
pub mod input;
pub mod matcher;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod segmenter;
