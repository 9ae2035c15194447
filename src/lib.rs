pub mod agents;
pub mod brief;
pub mod capability;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod jobs;
pub mod llm;
pub mod pipeline;
pub mod profiles;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod versioning;
