//! Ordering gate for every mutation of an account.
//!
//! Each lane (the mailbox tree, or one mailbox) has a single worker task
//! draining a queue of jobs one after the other, so two writes on the same
//! mailbox never overlap, whatever the number of sessions. A job belongs to
//! the worker once enqueued: it runs to completion even if the caller stops
//! waiting for it. Reads never go through here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot, watch};

use coffre_user::config::RetryPolicy;

use crate::error::{Error, Result};
use crate::unique_ident::UniqueIdent;

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Creation, deletion, renaming and subscription of mailboxes.
    Tree,
    Mailbox(UniqueIdent),
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree => f.write_str("tree"),
            Self::Mailbox(id) => write!(f, "mailbox:{}", id),
        }
    }
}

pub struct WriteSerializer {
    lanes: Mutex<HashMap<Lane, mpsc::UnboundedSender<Job>>>,
    policy: RetryPolicy,
    must_exit: watch::Receiver<bool>,
}

impl WriteSerializer {
    pub fn new(policy: RetryPolicy, must_exit: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(HashMap::new()),
            policy,
            must_exit,
        })
    }

    /// Runs `op` on `lane` once every job enqueued before it has completed.
    ///
    /// `op` is the whole read-compute-write cycle: it is called again from
    /// scratch when the store reports a revision conflict or an outage, up
    /// to the bounds of the retry policy.
    pub async fn submit<T, F, Fut>(&self, lane: Lane, op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if *self.must_exit.borrow() {
            return Err(Error::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        let policy = self.policy;
        let job = async move {
            let res = with_retry(policy, lane, op).await;
            // the caller may be gone, the write is done anyway
            let _ = tx.send(res);
        }
        .boxed();

        self.sender(lane)?.send(job).map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Forgets `lane`: its worker stops once the jobs already enqueued are
    /// done. For the lanes of destroyed mailboxes, which nothing submits to
    /// anymore.
    pub fn retire(&self, lane: Lane) {
        if let Ok(mut lanes) = self.lanes.lock() {
            if lanes.remove(&lane).is_some() {
                tracing::debug!(lane=%lane, "write lane retired");
            }
        }
    }

    fn sender(&self, lane: Lane) -> Result<mpsc::UnboundedSender<Job>> {
        let mut lanes = self.lanes.lock().map_err(|_| Error::Shutdown)?;
        if let Some(tx) = lanes.get(&lane) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            tracing::debug!(lane=%lane, "write lane closed");
        });
        lanes.insert(lane, tx.clone());
        Ok(tx)
    }
}

async fn with_retry<T, F, Fut>(policy: RetryPolicy, lane: Lane, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut conflicts = 0u32;
    let mut outages = 0u32;
    loop {
        match op().await {
            Err(Error::RevisionConflict) => {
                conflicts += 1;
                if conflicts > policy.max_conflict_retries {
                    tracing::warn!(lane=%lane, attempts=conflicts, "giving up on conflicting write");
                    return Err(Error::WriteFailed(conflicts));
                }
                tracing::debug!(lane=%lane, attempt=conflicts, "revision conflict, rerunning write");
            }
            Err(Error::StoreUnavailable) => {
                outages += 1;
                if outages > policy.max_unavailable_retries {
                    tracing::warn!(lane=%lane, attempts=outages, "store still unavailable");
                    return Err(Error::StoreUnavailable);
                }
                let backoff = policy
                    .backoff_base_ms
                    .saturating_mul(1u64 << (outages - 1).min(16));
                tracing::debug!(lane=%lane, backoff_ms=backoff, "store unavailable, backing off");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_conflict_retries: 3,
            max_unavailable_retries: 2,
            backoff_base_ms: 1,
        }
    }

    #[tokio::test]
    async fn jobs_on_one_lane_never_overlap() {
        let (_tx, rx) = watch::channel(false);
        let ser = WriteSerializer::new(policy(), rx);
        let inflight = Arc::new(AtomicU32::new(0));
        let log = Arc::new(Mutex::new(vec![]));

        let handles = (0..20u32)
            .map(|i| {
                let ser = ser.clone();
                let inflight = inflight.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    ser.submit(Lane::Tree, move || {
                        let inflight = inflight.clone();
                        let log = log.clone();
                        async move {
                            assert_eq!(inflight.fetch_add(1, Ordering::SeqCst), 0);
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            log.lock().unwrap().push(i);
                            inflight.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        }
                    })
                    .await
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(log.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn conflicts_are_retried_then_fail() {
        let (_tx, rx) = watch::channel(false);
        let ser = WriteSerializer::new(policy(), rx);

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = ser
            .submit(Lane::Tree, move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::RevisionConflict)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(res, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let res: Result<()> = ser
            .submit(Lane::Tree, || async { Err(Error::RevisionConflict) })
            .await;
        assert_eq!(res, Err(Error::WriteFailed(4)));

        let res: Result<()> = ser
            .submit(Lane::Tree, || async { Err(Error::StoreUnavailable) })
            .await;
        assert_eq!(res, Err(Error::StoreUnavailable));

        let res: Result<()> = ser
            .submit(Lane::Tree, || async { Err(Error::MailboxNotFound("x".into())) })
            .await;
        assert_eq!(res, Err(Error::MailboxNotFound("x".into())));
    }

    #[tokio::test]
    async fn enqueued_job_survives_its_caller() {
        let (_tx, rx) = watch::channel(false);
        let ser = WriteSerializer::new(policy(), rx);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        let caller = {
            let ser = ser.clone();
            tokio::spawn(async move {
                ser.submit(Lane::Tree, move || {
                    let done_tx = done_tx.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if let Some(tx) = done_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        Ok(())
                    }
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        caller.abort();

        done_rx.await.expect("job must complete even if the caller is gone");
    }

    #[tokio::test]
    async fn retired_lane_is_forgotten_after_its_jobs() {
        let (_tx, rx) = watch::channel(false);
        let ser = WriteSerializer::new(policy(), rx);
        let lane = Lane::Mailbox(crate::unique_ident::gen_ident());
        ser.submit(Lane::Tree, || async { Ok(()) }).await.unwrap();

        let slow = {
            let ser = ser.clone();
            tokio::spawn(async move {
                ser.submit(lane, || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok("purged")
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ser.lanes.lock().unwrap().len(), 2);

        ser.retire(lane);
        assert_eq!(ser.lanes.lock().unwrap().len(), 1);
        assert_eq!(slow.await.unwrap(), Ok("purged"));

        // a later job gets a fresh lane
        ser.submit(lane, || async { Ok(()) }).await.unwrap();
        ser.retire(lane);
        assert_eq!(ser.lanes.lock().unwrap().keys().collect::<Vec<_>>(), vec![&Lane::Tree]);
    }

    #[tokio::test]
    async fn rejected_after_shutdown() {
        let (tx, rx) = watch::channel(false);
        let ser = WriteSerializer::new(policy(), rx);
        tx.send(true).unwrap();
        let res: Result<()> = ser.submit(Lane::Tree, || async { Ok(()) }).await;
        assert_eq!(res, Err(Error::Shutdown));
    }
}
