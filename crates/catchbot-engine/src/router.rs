//! Entry point for every inbound message.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use catchbot_contracts::chat::{control_help, parse_control, ControlAction};
use catchbot_contracts::config::AgentConfig;
use catchbot_contracts::messages::InboundMessage;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastTask;
use crate::dispatcher::Dispatcher;
use crate::pacer::ChatTransport;

pub const UNRECOGNIZED_COMMAND_REPLY: &str = "I don't understand your command";

/// Refreshes the reference sprite set on demand.
pub trait DataRegenerator: Send + Sync {
    /// Returns the number of assets written.
    fn regenerate(&self) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Workflow,
    BroadcastStarted,
    BroadcastStopped,
    RegenerationStarted,
    Help,
    /// A control command that could not be honoured; the reason was sent
    /// back to the channel.
    Rejected(String),
    Ignored,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub game_bot_name: String,
    pub operator_ids: Vec<String>,
}

impl RouterSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            game_bot_name: config.game_bot_name.clone(),
            operator_ids: config.operator_ids.clone(),
        }
    }

    fn is_operator(&self, author_id: &str) -> bool {
        self.operator_ids.is_empty() || self.operator_ids.iter().any(|id| id == author_id)
    }
}

pub struct EventRouter {
    settings: RouterSettings,
    dispatcher: Dispatcher,
    broadcast: BroadcastTask,
    replies: Arc<dyn ChatTransport>,
    regenerator: Option<Arc<dyn DataRegenerator>>,
    regeneration: Option<thread::JoinHandle<()>>,
}

impl EventRouter {
    pub fn new(
        settings: RouterSettings,
        dispatcher: Dispatcher,
        broadcast: BroadcastTask,
        replies: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            settings,
            dispatcher,
            broadcast,
            replies,
            regenerator: None,
            regeneration: None,
        }
    }

    pub fn with_regenerator(mut self, regenerator: Arc<dyn DataRegenerator>) -> Self {
        self.regenerator = Some(regenerator);
        self
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcast.is_active()
    }

    pub fn route(&mut self, message: InboundMessage) -> Route {
        if message.author.username == self.settings.game_bot_name {
            return match self.dispatcher.dispatch(message) {
                Ok(()) => Route::Workflow,
                Err(err) => {
                    error!("failed to dispatch game message: {err:#}");
                    Route::Ignored
                }
            };
        }

        let Some(intent) = parse_control(&message.content) else {
            return Route::Ignored;
        };
        if !self.settings.is_operator(&message.author.id) {
            debug!(author = %message.author.id, command = %intent.command, "control command from non-operator");
            return Route::Ignored;
        }

        let channel_id = message.channel_id.as_str();
        let route = match intent.action {
            ControlAction::BroadcastOn => match self.broadcast.start(channel_id) {
                Ok(()) => Route::BroadcastStarted,
                Err(err) => Route::Rejected(err.to_string()),
            },
            ControlAction::BroadcastOff => match self.broadcast.stop() {
                Ok(()) => Route::BroadcastStopped,
                Err(err) => Route::Rejected(err.to_string()),
            },
            ControlAction::RegenerateAssets => self.start_regeneration(),
            ControlAction::Help => {
                self.reply(channel_id, &control_help());
                Route::Help
            }
            ControlAction::Unrecognized { command, arg } => {
                warn!(command = %command, arg = %arg, "unrecognized control command");
                Route::Rejected(UNRECOGNIZED_COMMAND_REPLY.to_string())
            }
        };
        info!(command = %intent.command, ?route, "control command handled");
        if let Route::Rejected(reason) = &route {
            self.reply(channel_id, reason);
        }
        route
    }

    /// Stop background work and drain every channel queue.
    pub fn shutdown(&mut self) {
        if self.broadcast.is_active() {
            let _ = self.broadcast.stop();
        }
        if let Some(handle) = self.regeneration.take() {
            let _ = handle.join();
        }
        self.dispatcher.shutdown();
    }

    fn start_regeneration(&mut self) -> Route {
        let Some(regenerator) = self.regenerator.clone() else {
            return Route::Rejected("Asset regeneration is not available.".to_string());
        };
        let running = self
            .regeneration
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if running {
            return Route::Rejected("Asset regeneration is already running.".to_string());
        }
        if let Some(handle) = self.regeneration.take() {
            let _ = handle.join();
        }

        let spawned = thread::Builder::new()
            .name("regenerate-assets".to_string())
            .spawn(move || match regenerator.regenerate() {
                Ok(count) => info!(count, "reference assets regenerated"),
                Err(err) => error!("asset regeneration failed: {err:#}"),
            });
        match spawned {
            Ok(handle) => {
                self.regeneration = Some(handle);
                Route::RegenerationStarted
            }
            Err(err) => Route::Rejected(format!("Asset regeneration failed to start: {err}")),
        }
    }

    fn reply(&self, channel_id: &str, text: &str) {
        if let Err(err) = self.replies.send_message(channel_id, text) {
            error!(channel_id, "failed to send reply: {err:#}");
        }
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
