//! Per-channel workflow workers.
//!
//! Every channel gets its own worker thread that owns that channel's
//! [`WorkflowState`]; messages are queued over an mpsc channel, so routing
//! never blocks on command pacing and no state is shared between threads.
//! Workers with an empty queue, no pending transaction and no traffic for
//! the idle timeout are stopped on the next dispatch.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use catchbot_contracts::config::DEFAULT_CHANNEL_IDLE_SECS;
use catchbot_contracts::messages::InboundMessage;
use tracing::{debug, error, info_span};

use crate::workflow::{CatchSellWorkflow, WorkflowState};

enum WorkerCommand {
    Message(Box<InboundMessage>),
    Stop,
}

/// Written by the worker after each message, read by the dispatcher.
#[derive(Debug)]
struct WorkerActivity {
    queued: usize,
    idle: bool,
    last_active: Instant,
}

impl WorkerActivity {
    fn new(now: Instant) -> Self {
        Self {
            queued: 0,
            idle: true,
            last_active: now,
        }
    }
}

struct ChannelWorker {
    sender: mpsc::Sender<WorkerCommand>,
    handle: thread::JoinHandle<()>,
    activity: Arc<Mutex<WorkerActivity>>,
}

impl ChannelWorker {
    fn is_quiet(&self, idle_timeout: Duration, now: Instant) -> bool {
        self.activity
            .lock()
            .map(|activity| {
                activity.queued == 0
                    && activity.idle
                    && now.saturating_duration_since(activity.last_active) >= idle_timeout
            })
            .unwrap_or(false)
    }
}

pub struct Dispatcher {
    workflow: Arc<CatchSellWorkflow>,
    workers: HashMap<String, ChannelWorker>,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(workflow: Arc<CatchSellWorkflow>) -> Self {
        Self {
            workflow,
            workers: HashMap::new(),
            idle_timeout: Duration::from_secs(DEFAULT_CHANNEL_IDLE_SECS),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue `message` on its channel's worker, starting one if needed.
    pub fn dispatch(&mut self, message: InboundMessage) -> Result<()> {
        self.reap_workers(Instant::now());
        let channel_id = message.channel_id.clone();
        if !self.workers.contains_key(&channel_id) {
            let worker = self.spawn_worker(&channel_id)?;
            self.workers.insert(channel_id.clone(), worker);
        }
        let worker = self
            .workers
            .get(&channel_id)
            .ok_or_else(|| anyhow!("no worker for channel {channel_id}"))?;
        if let Ok(mut activity) = worker.activity.lock() {
            activity.queued += 1;
        }
        worker
            .sender
            .send(WorkerCommand::Message(Box::new(message)))
            .map_err(|_| anyhow!("worker for channel {channel_id} is not running"))
    }

    pub fn active_channels(&self) -> usize {
        self.workers.len()
    }

    /// Drain every queue and join the workers.
    pub fn shutdown(&mut self) {
        for (channel_id, worker) in self.workers.drain() {
            stop_worker(&channel_id, worker);
        }
    }

    fn spawn_worker(&self, channel_id: &str) -> Result<ChannelWorker> {
        let (tx, rx) = mpsc::channel();
        let workflow = Arc::clone(&self.workflow);
        let activity = Arc::new(Mutex::new(WorkerActivity::new(Instant::now())));
        let worker_activity = Arc::clone(&activity);
        let owned_channel = channel_id.to_string();
        let handle = thread::Builder::new()
            .name(format!("workflow-{channel_id}"))
            .spawn(move || run_channel_worker(workflow, owned_channel, rx, worker_activity))
            .with_context(|| format!("failed to spawn worker for channel {channel_id}"))?;
        debug!(channel_id, "started channel worker");
        Ok(ChannelWorker {
            sender: tx,
            handle,
            activity,
        })
    }

    /// Join workers that exited and stop the quiet ones. Only this thread
    /// queues messages, so a drained worker cannot receive one mid-stop.
    fn reap_workers(&mut self, now: Instant) {
        let reapable: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| {
                worker.handle.is_finished() || worker.is_quiet(self.idle_timeout, now)
            })
            .map(|(channel_id, _)| channel_id.clone())
            .collect();
        for channel_id in reapable {
            if let Some(worker) = self.workers.remove(&channel_id) {
                debug!(channel_id = %channel_id, "stopping quiet channel worker");
                stop_worker(&channel_id, worker);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_worker(channel_id: &str, worker: ChannelWorker) {
    let _ = worker.sender.send(WorkerCommand::Stop);
    if worker.handle.join().is_err() {
        error!(channel_id, "channel worker panicked");
    }
}

fn run_channel_worker(
    workflow: Arc<CatchSellWorkflow>,
    channel_id: String,
    rx: mpsc::Receiver<WorkerCommand>,
    activity: Arc<Mutex<WorkerActivity>>,
) {
    let span = info_span!("channel", channel_id = %channel_id);
    let _entered = span.enter();
    let mut state = WorkflowState::default();

    while let Ok(command) = rx.recv() {
        let message = match command {
            WorkerCommand::Message(message) => message,
            WorkerCommand::Stop => break,
        };
        match workflow.handle_message(&mut state, &message) {
            Ok(transition) => debug!(?transition, phase = ?state.phase(), "message handled"),
            Err(err) => error!("workflow step failed: {err:#}"),
        }
        if let Ok(mut activity) = activity.lock() {
            activity.queued = activity.queued.saturating_sub(1);
            activity.idle = state.is_idle();
            activity.last_active = Instant::now();
        }
    }
}
