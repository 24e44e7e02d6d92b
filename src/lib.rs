pub mod advisor;
pub mod api;
pub mod blob;
pub mod config;
pub mod db;
pub mod gateway;
pub mod illustrator;
pub mod model;
pub mod pipeline;
pub mod prompts;
