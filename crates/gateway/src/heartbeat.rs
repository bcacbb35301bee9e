//! Application-level heartbeat.
//!
//! Two tasks per connection:
//! - the pulse enqueues the current sequence number every interval (the
//!   first one after a random fraction of it);
//! - the beat drains the queue and sends one heartbeat per batch.
//!
//! Every ACK or server heartbeat request bumps the ack counter; the beat
//! zeroes it just before each send. A beat that finds the counter still at
//! zero declares the connection dead and asks the manager to reconnect.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::{
        sync::{Notify, mpsc},
        time::{Instant, MissedTickBehavior},
    },
    tracing::{debug, trace, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{error::Result, manager::Manager};

/// The connection side the heartbeat tasks talk to.
#[async_trait]
pub trait Beater: Send + Sync + 'static {
    /// Last sequence number received, zero when none.
    fn sequence(&self) -> u64;

    /// Write a heartbeat frame, bypassing the command rate limit.
    async fn send_heartbeat(&self, sequence: u64) -> Result<()>;
}

pub struct Heartbeat {
    interval: Duration,
    acks: AtomicU32,
    reset: Notify,
    queue: mpsc::Sender<u64>,
}

impl Heartbeat {
    /// A heartbeat and the receiving half of its pending queue, which the
    /// beat task owns.
    pub fn new(interval: Duration, capacity: usize) -> (Arc<Self>, mpsc::Receiver<u64>) {
        let (queue, pending) = mpsc::channel(capacity.max(1));
        let heartbeat = Arc::new(Self {
            interval,
            // The first beat goes out before any ACK could have arrived.
            acks: AtomicU32::new(1),
            reset: Notify::new(),
            queue,
        });
        (heartbeat, pending)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// ACKs and server heartbeat requests since the last send.
    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    /// Queue a heartbeat for `sequence`. A full queue already holds a
    /// pending beat, which will carry the newer sequence when coalesced.
    pub fn enqueue(&self, sequence: u64) {
        match self.queue.try_send(sequence) {
            Ok(()) => trace!(seq = sequence, "heartbeat queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(seq = sequence, "heartbeat queue full, dropping pulse");
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {},
        }
    }

    /// Ask the pulse to restart its interval from now.
    pub fn reset_ticker(&self) {
        self.reset.notify_one();
    }

    /// Heartbeats the server will see per `window` at this interval,
    /// rounded up, plus one for a server-requested beat.
    pub fn per_window(&self, window: Duration) -> i64 {
        let interval = self.interval.as_millis().max(1);
        window.as_millis().div_ceil(interval) as i64 + 1
    }
}

/// Enqueue a heartbeat every interval until cancelled.
pub async fn pulse(heartbeat: Arc<Heartbeat>, conn: Arc<dyn Beater>, manager: Arc<Manager>) -> Result<()> {
    let cancel = manager.token();
    let jitter = heartbeat.interval.mul_f64(rand::random::<f64>());
    debug!(
        interval_ms = heartbeat.interval.as_millis() as u64,
        jitter_ms = jitter.as_millis() as u64,
        "heartbeat pulse starting"
    );
    tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        () = tokio::time::sleep(jitter) => {},
    }
    heartbeat.enqueue(conn.sequence());

    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = heartbeat.reset.notified() => ticker.reset(),
            _ = ticker.tick() => heartbeat.enqueue(conn.sequence()),
        }
    }
}

/// Send queued heartbeats until cancelled or the connection stops
/// acknowledging them.
pub async fn beat(
    heartbeat: Arc<Heartbeat>,
    conn: Arc<dyn Beater>,
    mut pending: mpsc::Receiver<u64>,
    manager: Arc<Manager>,
) -> Result<()> {
    let cancel = manager.token();
    loop {
        let mut sequence = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = pending.recv() => match next {
                Some(sequence) => sequence,
                None => return Ok(()),
            },
        };

        if heartbeat.acks() == 0 {
            warn!("no heartbeat ACK since the last beat, reconnecting");
            manager.reconnect();
            return Ok(());
        }

        while let Ok(next) = pending.try_recv() {
            sequence = sequence.max(next);
        }

        // Zeroed before the write so an ACK racing the send still counts.
        heartbeat.acks.store(0, Ordering::SeqCst);
        conn.send_heartbeat(sequence).await?;
        #[cfg(feature = "metrics")]
        counter!("gateway_heartbeats_total").increment(1);
        heartbeat.reset_ticker();
        trace!(seq = sequence, "heartbeat sent");
    }
}
