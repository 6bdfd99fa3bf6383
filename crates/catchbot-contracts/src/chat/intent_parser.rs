use super::command_registry::{
    ActionKind, CommandSpec, NO_ARG_COMMANDS, TOGGLE_COMMANDS, TOGGLE_OFF, TOGGLE_ON,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    BroadcastOn,
    BroadcastOff,
    RegenerateAssets,
    Help,
    /// A known command with an argument it does not accept.
    Unrecognized { command: String, arg: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlIntent {
    pub action: ControlAction,
    pub command: String,
    pub raw: String,
}

impl ControlIntent {
    fn new(action: ControlAction, command: &str, raw: &str) -> Self {
        Self {
            action,
            command: command.to_string(),
            raw: raw.to_string(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<ActionKind> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn toggle_action(kind: ActionKind, on: bool) -> ControlAction {
    match (kind, on) {
        (ActionKind::Broadcast, true) => ControlAction::BroadcastOn,
        (ActionKind::Broadcast, false) => ControlAction::BroadcastOff,
        (ActionKind::RegenerateAssets, _) => ControlAction::RegenerateAssets,
        (ActionKind::Help, _) => ControlAction::Help,
    }
}

/// Parse a chat line addressed to the agent itself.
///
/// Returns `None` for anything that is not one of the agent's slash
/// commands, so ordinary chatter and other bots' commands pass through.
pub fn parse_control(text: &str) -> Option<ControlIntent> {
    let raw_trimmed = text.trim();
    let slash_tail = raw_trimmed.strip_prefix('/')?;
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return None;
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let remainder = &slash_tail[command_len..];
    if !remainder.is_empty() && !remainder.starts_with(char::is_whitespace) {
        return None;
    }
    let arg = remainder.trim();

    if let Some(kind) = find_action(&command, TOGGLE_COMMANDS) {
        let args = parse_args(arg);
        let action = match args.as_slice() {
            [single] if single == TOGGLE_ON => toggle_action(kind, true),
            [single] if single == TOGGLE_OFF => toggle_action(kind, false),
            _ => ControlAction::Unrecognized {
                command: command.clone(),
                arg: arg.to_string(),
            },
        };
        return Some(ControlIntent::new(action, &command, text));
    }

    if let Some(kind) = find_action(&command, NO_ARG_COMMANDS) {
        let action = if arg.is_empty() {
            toggle_action(kind, true)
        } else {
            ControlAction::Unrecognized {
                command: command.clone(),
                arg: arg.to_string(),
            }
        };
        return Some(ControlIntent::new(action, &command, text));
    }

    None
}
