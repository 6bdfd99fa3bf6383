use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use catchbot_contracts::config::BroadcastConfig;
use thiserror::Error;
use tracing::{error, info};

use crate::pacer::PacedSender;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("Broadcast is already running in channel {0}.")]
    AlreadyActive(String),
    #[error("Broadcast is not running.")]
    NotActive,
    #[error("Broadcast worker failed to start: {0}")]
    Spawn(String),
}

enum BroadcastCommand {
    Stop,
}

struct ActiveBroadcast {
    channel_id: String,
    sender: mpsc::Sender<BroadcastCommand>,
    handle: thread::JoinHandle<()>,
    stop_flag: Arc<AtomicBool>,
}

/// User-toggled periodic message sender. At most one worker runs at a time.
pub struct BroadcastTask {
    sender: PacedSender,
    message: String,
    interval: Duration,
    active: Option<ActiveBroadcast>,
}

impl BroadcastTask {
    pub fn new(sender: PacedSender, config: &BroadcastConfig) -> Self {
        Self {
            sender,
            message: config.message.clone(),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn channel(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.channel_id.as_str())
    }

    pub fn start(&mut self, channel_id: &str) -> Result<(), BroadcastError> {
        self.cleanup_finished_worker();
        if let Some(active) = self.active.as_ref() {
            return Err(BroadcastError::AlreadyActive(active.channel_id.clone()));
        }

        let (tx, rx) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker = BroadcastWorker {
            sender: self.sender.clone(),
            channel_id: channel_id.to_string(),
            message: self.message.clone(),
            interval: self.interval,
            stop_flag: Arc::clone(&stop_flag),
        };
        let handle = thread::Builder::new()
            .name("broadcast".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|err| BroadcastError::Spawn(err.to_string()))?;

        self.active = Some(ActiveBroadcast {
            channel_id: channel_id.to_string(),
            sender: tx,
            handle,
            stop_flag,
        });
        Ok(())
    }

    /// Returns only after the worker has exited; nothing is sent afterwards.
    pub fn stop(&mut self) -> Result<(), BroadcastError> {
        let Some(active) = self.active.take() else {
            return Err(BroadcastError::NotActive);
        };
        active.stop_flag.store(true, Ordering::SeqCst);
        let _ = active.sender.send(BroadcastCommand::Stop);
        if active.handle.join().is_err() {
            error!("broadcast worker panicked");
        }
        Ok(())
    }

    fn cleanup_finished_worker(&mut self) {
        let finished = self
            .active
            .as_ref()
            .map(|active| active.handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return;
        }
        if let Some(active) = self.active.take() {
            let _ = active.handle.join();
        }
    }
}

impl Drop for BroadcastTask {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct BroadcastWorker {
    sender: PacedSender,
    channel_id: String,
    message: String,
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
}

impl BroadcastWorker {
    fn run(self, rx: mpsc::Receiver<BroadcastCommand>) {
        info!(channel_id = %self.channel_id, "broadcast started");
        loop {
            if !self.wait(self.interval, &rx) {
                break;
            }
            let delay = self.sender.pacer().sample();
            if !self.wait(delay, &rx) {
                break;
            }
            if let Err(err) = self
                .sender
                .transport()
                .send_message(&self.channel_id, &self.message)
            {
                error!(channel_id = %self.channel_id, "failed to send broadcast: {err:#}");
            }
        }
        info!(channel_id = %self.channel_id, "broadcast stopped");
    }

    /// Sleep for `timeout` unless stopped first; returns whether to keep going.
    fn wait(&self, timeout: Duration, rx: &mpsc::Receiver<BroadcastCommand>) -> bool {
        if self.stop_flag.load(Ordering::SeqCst) {
            return false;
        }
        match rx.recv_timeout(timeout) {
            Ok(BroadcastCommand::Stop) => false,
            Err(mpsc::RecvTimeoutError::Timeout) => !self.stop_flag.load(Ordering::SeqCst),
            Err(mpsc::RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::pacer::Pacer;
    use crate::test_support::RecordingTransport;

    fn task(transport: Arc<RecordingTransport>, pacer: Pacer) -> BroadcastTask {
        BroadcastTask::new(
            PacedSender::new(transport, pacer, "p!"),
            &BroadcastConfig {
                interval_ms: 10,
                message: "spam".to_string(),
            },
        )
    }

    #[test]
    fn start_twice_is_rejected() -> anyhow::Result<()> {
        let transport = RecordingTransport::new();
        let mut task = task(transport, Pacer::immediate());
        task.start("42")?;
        assert_eq!(
            task.start("42"),
            Err(BroadcastError::AlreadyActive("42".to_string()))
        );
        assert_eq!(task.channel(), Some("42"));
        task.stop()?;
        Ok(())
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let mut task = task(RecordingTransport::new(), Pacer::immediate());
        assert_eq!(task.stop(), Err(BroadcastError::NotActive));
        assert!(!task.is_active());
    }

    #[test]
    fn nothing_is_sent_after_stop_returns() -> anyhow::Result<()> {
        let transport = RecordingTransport::new();
        let mut task = task(transport.clone(), Pacer::immediate());
        task.start("42")?;
        thread::sleep(Duration::from_millis(120));
        task.stop()?;
        assert!(!task.is_active());

        let sent = transport.count();
        assert!(sent >= 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(transport.count(), sent);
        assert!(transport
            .sent()
            .iter()
            .all(|(channel, text)| channel == "42" && text == "spam"));
        Ok(())
    }

    #[test]
    fn restart_after_stop_succeeds() -> anyhow::Result<()> {
        let transport = RecordingTransport::new();
        let mut task = task(transport.clone(), Pacer::immediate());
        task.start("42")?;
        task.stop()?;
        task.start("7")?;
        assert_eq!(task.channel(), Some("7"));
        thread::sleep(Duration::from_millis(80));
        task.stop()?;
        assert!(transport.sent().iter().any(|(channel, _)| channel == "7"));
        Ok(())
    }

    #[test]
    fn stop_interrupts_pacing_delay() -> anyhow::Result<()> {
        let transport = RecordingTransport::new();
        let slow = Pacer::new(Duration::from_secs(30), Duration::from_secs(30));
        let mut task = task(transport.clone(), slow);
        task.start("42")?;
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        task.stop()?;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.count(), 0);
        Ok(())
    }
}
