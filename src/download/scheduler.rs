use crate::download::{
    errors::DownloadError,
    queue::{DownloadQueue, PassReport},
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, MissedTickBehavior, interval};

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub queue_len: usize,
    pub active: usize,
    pub passes: u64,
    pub last_pass: Option<PassReport>,
    pub started_at: Instant,
}

#[derive(Debug)]
pub enum SchedulerCommand {
    RunPass { reply: oneshot::Sender<PassReport> },
    Ping { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Run a pass now instead of waiting for the next tick.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::RunPass { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)
    }

    pub async fn ping(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Ping { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Shutdown { reply: tx })
            .await
            .map_err(|_| DownloadError::ChannelClosed)?;
        rx.await.map_err(|_| DownloadError::ChannelClosed)?;
        Ok(())
    }
}

pub fn start_scheduler(
    queue: Arc<DownloadQueue>,
    tick: Duration,
) -> (
    SchedulerHandle,
    watch::Receiver<SchedulerStatus>,
    tokio::task::JoinHandle<Result<()>>,
) {
    let (tx, rx) = mpsc::channel(32);
    let (status_tx, status_rx) = watch::channel(SchedulerStatus {
        running: true,
        queue_len: queue.len(),
        active: 0,
        passes: 0,
        last_pass: None,
        started_at: Instant::now(),
    });
    let join = tokio::spawn(run_scheduler(queue, tick, rx, status_tx));
    (SchedulerHandle { tx }, status_rx, join)
}

async fn run_scheduler(
    queue: Arc<DownloadQueue>,
    tick: Duration,
    mut rx: mpsc::Receiver<SchedulerCommand>,
    status_tx: watch::Sender<SchedulerStatus>,
) -> Result<()> {
    let mut pass_tick = interval(tick.max(Duration::from_millis(10)));
    // After a suspend, run one pass rather than a burst of catch-up passes.
    pass_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = pass_tick.tick() => {
                run_and_publish(&queue, &status_tx);
            }
            cmd = rx.recv() => match cmd {
                Some(SchedulerCommand::RunPass { reply }) => {
                    let report = run_and_publish(&queue, &status_tx);
                    let _ = reply.send(report);
                }
                Some(SchedulerCommand::Ping { reply }) => {
                    let _ = reply.send(());
                }
                Some(SchedulerCommand::Shutdown { reply }) => {
                    let _ = reply.send(());
                    break;
                }
                None => break,
            },
        }
    }

    status_tx.send_modify(|s| s.running = false);
    tracing::info!("download scheduler stopped");
    Ok(())
}

fn run_and_publish(queue: &DownloadQueue, status_tx: &watch::Sender<SchedulerStatus>) -> PassReport {
    let report = queue.run_pass();
    if report.evicted > 0 || report.activated > 0 || report.demoted > 0 {
        tracing::debug!(
            evicted = report.evicted,
            activated = report.activated,
            demoted = report.demoted,
            active = report.active,
            queued = report.queued,
            "scheduler pass"
        );
    }
    status_tx.send_modify(|s| {
        s.queue_len = report.queued;
        s.active = report.active;
        s.passes += 1;
        s.last_pass = Some(report.clone());
    });
    report
}
