pub mod catalog;
pub mod config;
pub mod detect;
pub mod drive;
pub mod error;
pub mod layout;
pub mod model;
pub mod orchestrator;
pub mod promote;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod sheet;
pub mod stage;
