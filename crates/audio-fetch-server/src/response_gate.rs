//! Exactly-once response delivery for a download job.
//!
//! The HTTP handler holds the receiving half; the job holds the gate. Whichever
//! completion path claims the gate first produces the response. Replies that
//! lose the race, or that nobody is waiting for any more, are dropped on the
//! spot, which deletes any artifact they carry.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;

use crate::artifact::Artifact;
use crate::errors::DownloadError;

/// Terminal result handed from a job to its HTTP handler.
#[derive(Debug)]
pub enum JobReply {
    Audio { artifact: Artifact, title: String },
    Failed(DownloadError),
}

/// What happened to a reply offered to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// This reply is the response.
    Sent,
    /// Another path already produced the response.
    AlreadyClaimed,
    /// The gate was claimed but the client had already gone away.
    ClientGone,
}

#[derive(Debug)]
pub struct ResponseGate {
    claimed: AtomicBool,
    reply_tx: Mutex<Option<oneshot::Sender<JobReply>>>,
}

impl ResponseGate {
    pub fn new() -> (Self, oneshot::Receiver<JobReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                claimed: AtomicBool::new(false),
                reply_tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    #[cfg(test)]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Claim the gate and hand `reply` to the waiting handler.
    pub fn deliver(&self, reply: JobReply) -> Delivery {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("response already sent; dropping reply");
            return Delivery::AlreadyClaimed;
        }
        let tx = self.reply_tx.lock().ok().and_then(|mut slot| slot.take());
        let Some(tx) = tx else {
            return Delivery::AlreadyClaimed;
        };
        match tx.send(reply) {
            Ok(()) => Delivery::Sent,
            Err(_reply) => {
                tracing::info!("client disconnected before the response was ready");
                Delivery::ClientGone
            }
        }
    }
}
