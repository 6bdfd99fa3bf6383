#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: ActionKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ActionKind {
    Broadcast,
    RegenerateAssets,
    Help,
}

/// Commands taking exactly one `on`/`off` argument.
pub(crate) const TOGGLE_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "spam",
    action: ActionKind::Broadcast,
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "generate_data",
        action: ActionKind::RegenerateAssets,
    },
    CommandSpec {
        command: "help",
        action: ActionKind::Help,
    },
];

pub(crate) const TOGGLE_ON: &str = "on";
pub(crate) const TOGGLE_OFF: &str = "off";

pub const CONTROL_HELP_COMMANDS: &[&str] = &["/spam on", "/spam off", "/generate_data", "/help"];

const CONTROL_HELP_HEADER: &str = "Control commands:";

/// One-line help reply. It starts with plain text so the agent never parses
/// its own echoed reply as a command.
pub fn control_help() -> String {
    format!("{CONTROL_HELP_HEADER} {}", CONTROL_HELP_COMMANDS.join(", "))
}
