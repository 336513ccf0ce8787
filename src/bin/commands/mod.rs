pub mod command;
pub mod tag;
