pub mod command;
pub mod config;
pub mod platform;
pub mod protocol;
pub mod selection;
pub mod state;
