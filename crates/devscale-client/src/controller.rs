//! The request parallelism controller: a fixed pool of requester slots
//! multiplexed against a runtime-adjustable target.
//!
//! Slots signal "go" tokens rather than being created and destroyed:
//! promotion sends a token to an idle slot, demotion silently drops the
//! slot's next completion token. All slot state is owned by the
//! controller loop and mutated nowhere else.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Control commands for the parallelism controller. Commands that expect
/// an answer carry a oneshot sender for the reply.
#[derive(Debug)]
pub enum Command {
    /// Set the target parallelism; replies with the value clamped to
    /// `[0, req_max]`.
    SetParallel {
        value: i64,
        reply: oneshot::Sender<usize>,
    },
}

/// Owns the slot pool wiring and the current target.
#[derive(Debug)]
pub struct Controller {
    req_max: usize,
    req_now: usize,
    proceed: Vec<mpsc::Sender<()>>,
    finished_rx: mpsc::Receiver<usize>,
}

impl Controller {
    /// Create the slot wiring for `req_max` requesters with `req_now` of
    /// them armed. Returns the per-slot go-ahead receivers and the shared
    /// completion sender; the caller spawns one requester per receiver.
    ///
    /// The completion channel holds one entry per slot so a demotion
    /// transient can never block a requester that just finished; the
    /// go-ahead channels hold two entries so re-arming never blocks on a
    /// slot that is still in flight.
    pub fn new(
        req_max: usize,
        req_now: usize,
    ) -> (Self, Vec<mpsc::Receiver<()>>, mpsc::Sender<usize>) {
        let (finished_tx, finished_rx) = mpsc::channel(req_max.max(1));

        let mut proceed = Vec::with_capacity(req_max);
        let mut receivers = Vec::with_capacity(req_max);
        for slot in 0..req_max {
            let (tx, rx) = mpsc::channel(2);
            if slot < req_now {
                let _ = tx.try_send(());
            }
            proceed.push(tx);
            receivers.push(rx);
        }

        let controller = Self {
            req_max,
            req_now,
            proceed,
            finished_rx,
        };
        (controller, receivers, finished_tx)
    }

    /// Multiplex slot completions, control commands and the shutdown
    /// signal until the latter fires.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(slot) = self.finished_rx.recv() => self.slot_finished(slot),
                Some(cmd) = commands.recv() => self.handle(cmd),
                _ = &mut shutdown => {
                    info!("termination signal received");
                    return;
                }
            }
        }
    }

    fn slot_finished(&mut self, slot: usize) {
        // A demoted slot's token is dropped here; that is what drains
        // surplus parallelism after the target was lowered.
        if slot < self.req_now {
            if self.proceed[slot].try_send(()).is_err() {
                warn!(slot, "go-ahead channel full, token dropped");
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::SetParallel { value, reply } => {
                let target = value.clamp(0, self.req_max as i64) as usize;

                // promoted slots get an immediate go-ahead
                for tx in &self.proceed[self.req_now.min(target)..target] {
                    let _ = tx.try_send(());
                }

                if target as i64 != value {
                    info!(requested = value, constrained = target, "parallelization request constrained");
                }
                info!(from = self.req_now, to = target, "parallelization change");

                self.req_now = target;
                let _ = reply.send(target);
            }
        }
    }
}
