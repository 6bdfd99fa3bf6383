mod command_registry;
mod intent_parser;

pub use command_registry::{control_help, CONTROL_HELP_COMMANDS};
pub use intent_parser::{parse_control, ControlAction, ControlIntent};
