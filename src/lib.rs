pub mod audio;
pub mod config;
pub mod duration;
pub mod error;
pub mod library;
pub mod logging;
pub mod model;
pub mod player;
pub mod queue;
