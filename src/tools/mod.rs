pub mod command_executor;
pub mod input_interpreter;
pub mod output_pump;
pub mod platform;
pub mod script_tool;
pub mod terminal_tool;
pub mod termination;
