pub mod assets;
pub mod broadcast;
pub mod dispatcher;
pub mod hash;
pub mod identify;
pub mod pacer;
pub mod router;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use broadcast::{BroadcastError, BroadcastTask};
pub use dispatcher::Dispatcher;
pub use hash::{average_hash, CollisionPolicy, HashDigest, HashIndex};
pub use identify::{HttpImageSource, Identification, Identifier, IdentifyError, ImageSource};
pub use pacer::{ChatTransport, GameCommand, PacedSender, Pacer};
pub use router::{DataRegenerator, EventRouter, Route, RouterSettings};
pub use workflow::{CatchSellWorkflow, Phase, Transition, WorkflowSettings, WorkflowState};
