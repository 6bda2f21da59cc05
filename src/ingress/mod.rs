//! Ingress adapters driving the pipeline: HTTP and message queue

pub mod http;
pub mod queue;
mod server;

pub use server::CacheServer;
