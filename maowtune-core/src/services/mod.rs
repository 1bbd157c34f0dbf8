pub mod command_service;

pub use command_service::{describe_failure, CommandContext, CommandService, MusicCommand};
