use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const FLUSH_CHANNEL_CAPACITY: usize = 16;

/// One coalesced delivery: the latest state plus how many notifications it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Flush<S> {
    pub seq: u64,
    pub coalesced: u32,
    pub state: S,
}

#[derive(Debug)]
struct Pending<S> {
    state: Option<S>,
    count: u32,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl<S> Default for Pending<S> {
    fn default() -> Self {
        Self {
            state: None,
            count: 0,
            first_at: None,
            last_at: None,
        }
    }
}

struct Shared<S> {
    pending: Mutex<Pending<S>>,
    wake: Notify,
}

/// Trailing-edge debounce: a flush fires once `window` passes without a new
/// notification, or once `max_wait` has elapsed since the first pending one.
pub struct RenderScheduler<S> {
    shared: Arc<Shared<S>>,
    cancel_token: CancellationToken,
    close_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> RenderScheduler<S> {
    pub fn spawn(
        window: Duration,
        max_wait: Duration,
        parent_token: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Flush<S>>) {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
        });
        let cancel_token = parent_token.child_token();
        let close_token = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);

        let task = tokio::spawn(run_scheduler(
            Arc::clone(&shared),
            window,
            max_wait.max(window),
            sender,
            cancel_token.clone(),
            close_token.clone(),
        ));

        (
            Self {
                shared,
                cancel_token,
                close_token,
                task: Some(task),
            },
            receiver,
        )
    }

    /// Replaces any pending state; never blocks on the consumer.
    pub fn notify(&self, state: S) {
        let now = Instant::now();
        {
            let mut pending = self.shared.pending.lock();
            pending.state = Some(state);
            pending.count = pending.count.saturating_add(1);
            if pending.first_at.is_none() {
                pending.first_at = Some(now);
            }
            pending.last_at = Some(now);
        }
        self.shared.wake.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        self.shared.pending.lock().state.is_some()
    }

    /// Drops any pending state and stops delivering.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Delivers the pending state without waiting for the window, then closes
    /// the flush channel. Cancellation still wins over delivery.
    pub async fn close(&mut self) {
        self.close_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                debug!(%error, "render scheduler task did not join");
            }
        }
    }
}

impl<S> Drop for RenderScheduler<S> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run_scheduler<S: Send + 'static>(
    shared: Arc<Shared<S>>,
    window: Duration,
    max_wait: Duration,
    sender: mpsc::Sender<Flush<S>>,
    cancel_token: CancellationToken,
    close_token: CancellationToken,
) {
    let mut seq = 0_u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            _ = close_token.cancelled() => {
                let _ = deliver_pending(&shared, &mut seq, &sender, &cancel_token).await;
                return;
            }
            _ = shared.wake.notified() => {}
        }

        loop {
            let deadline = {
                let pending = shared.pending.lock();
                match (pending.first_at, pending.last_at) {
                    (Some(first_at), Some(last_at)) => (last_at + window).min(first_at + max_wait),
                    _ => break,
                }
            };

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return,
                _ = close_token.cancelled() => {
                    let _ = deliver_pending(&shared, &mut seq, &sender, &cancel_token).await;
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {}
                _ = shared.wake.notified() => continue,
            }

            if !deliver_pending(&shared, &mut seq, &sender, &cancel_token).await {
                return;
            }
            break;
        }
    }
}

/// Returns `false` once delivery must stop.
async fn deliver_pending<S>(
    shared: &Shared<S>,
    seq: &mut u64,
    sender: &mpsc::Sender<Flush<S>>,
    cancel_token: &CancellationToken,
) -> bool {
    let taken = std::mem::take(&mut *shared.pending.lock());
    let Some(state) = taken.state else {
        return true;
    };
    *seq = seq.saturating_add(1);
    trace!(seq = *seq, coalesced = taken.count, "render flush");

    let flush = Flush {
        seq: *seq,
        coalesced: taken.count,
        state,
    };
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => false,
        sent = sender.send(flush) => {
            if sent.is_err() {
                debug!("render consumer dropped, stopping scheduler");
                return false;
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);
    const MAX_WAIT: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn coalesces_burst_into_single_flush() {
        let token = CancellationToken::new();
        let (scheduler, mut flushes) = RenderScheduler::spawn(WINDOW, MAX_WAIT, &token);

        for state in 1..=10_u32 {
            scheduler.notify(state);
            tokio::time::sleep(Duration::from_millis(4)).await;
        }

        let flush = flushes.recv().await.expect("burst should produce a flush");
        assert_eq!(flush.state, 10);
        assert_eq!(flush.coalesced, 10);
        assert_eq!(flush.seq, 1);

        let extra = tokio::time::timeout(Duration::from_secs(1), flushes.recv()).await;
        assert!(extra.is_err(), "no further flush expected without new notifications");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_quiet_window_before_flushing() {
        let token = CancellationToken::new();
        let (scheduler, mut flushes) = RenderScheduler::spawn(WINDOW, MAX_WAIT, &token);
        let started = Instant::now();

        scheduler.notify("first");
        let flush = flushes.recv().await.expect("single notify should flush");

        assert_eq!(flush.state, "first");
        assert!(started.elapsed() >= WINDOW);
        assert!(!scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_load_is_bounded_by_max_wait() {
        let token = CancellationToken::new();
        let (scheduler, mut flushes) = RenderScheduler::spawn(WINDOW, MAX_WAIT, &token);

        let producer = tokio::spawn(async move {
            for state in 0..100_u32 {
                scheduler.notify(state);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            scheduler
        });

        let mut received = Vec::new();
        while let Ok(Some(flush)) =
            tokio::time::timeout(Duration::from_millis(500), flushes.recv()).await
        {
            received.push(flush);
        }
        let _scheduler = producer.await.expect("producer task should finish");

        assert!(received.len() >= 4, "got {} flushes", received.len());
        assert!(received.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        assert_eq!(received.last().map(|flush| flush.state), Some(99));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_delivery() {
        let token = CancellationToken::new();
        let (scheduler, mut flushes) = RenderScheduler::spawn(WINDOW, MAX_WAIT, &token);

        scheduler.notify(1_u8);
        token.cancel();

        assert!(flushes.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_delivers_pending_state_immediately() {
        let token = CancellationToken::new();
        let (mut scheduler, mut flushes) = RenderScheduler::spawn(WINDOW, MAX_WAIT, &token);
        let started = Instant::now();

        scheduler.notify("last words");
        scheduler.close().await;

        let flush = flushes.recv().await.expect("pending state should be delivered");
        assert_eq!(flush.state, "last words");
        assert!(started.elapsed() < WINDOW);
        assert!(flushes.recv().await.is_none());
    }
}
