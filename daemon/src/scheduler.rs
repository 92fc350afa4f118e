use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::sleep;

use hydrascan_common::config::{
    EXPLORER_MAX_CONCURRENT, EXPLORER_MAX_DELAY_MS, EXPLORER_MIN_DELAY_MS, RPC_MAX_CONCURRENT,
    RPC_MAX_DELAY_MS, RPC_MIN_DELAY_MS,
};

// Which of the two admission queues a request goes through
// Explorer APIs and node RPCs have independent quotas, so their
// traffic must never share a limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Explorer,
    Rpc,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_concurrent: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl QueueLimits {
    pub fn explorer() -> Self {
        Self {
            max_concurrent: EXPLORER_MAX_CONCURRENT,
            min_delay: Duration::from_millis(EXPLORER_MIN_DELAY_MS),
            max_delay: Duration::from_millis(EXPLORER_MAX_DELAY_MS),
        }
    }

    pub fn rpc() -> Self {
        Self {
            max_concurrent: RPC_MAX_CONCURRENT,
            min_delay: Duration::from_millis(RPC_MIN_DELAY_MS),
            max_delay: Duration::from_millis(RPC_MAX_DELAY_MS),
        }
    }
}

type Job = BoxFuture<'static, ()>;

struct Queue {
    tx: mpsc::UnboundedSender<Job>,
}

impl Queue {
    fn start(name: &'static str, limits: QueueLimits) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let semaphore = Arc::new(Semaphore::new(limits.max_concurrent));

        tokio::spawn(async move {
            // Strict FIFO: one admission at a time, gated by the
            // in-flight semaphore, then a jittered pause
            while let Some(job) = rx.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });

                let delay = uniform_delay(limits.min_delay, limits.max_delay);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
            debug!("{} dispatcher stopped", name);
        });

        Self { tx }
    }
}

// Draw the inter-dispatch pause uniformly from [min, max]
fn uniform_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

// Two independent FIFO admission controllers shared by every network
// scanner in the process
pub struct RateLimiter {
    explorer: Queue,
    rpc: Queue,
}

impl RateLimiter {
    pub fn new(explorer: QueueLimits, rpc: QueueLimits) -> Arc<Self> {
        Arc::new(Self {
            explorer: Queue::start("explorer", explorer),
            rpc: Queue::start("rpc", rpc),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(QueueLimits::explorer(), QueueLimits::rpc())
    }

    // Enqueue a request and wait for its result
    // There is no intrinsic failure mode here: the inner future's
    // output is returned as-is, and a cancelled caller simply drops
    // its receiving end
    pub async fn run<F, T>(&self, kind: QueueKind, fut: F) -> T
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let result = fut.await;
            // The caller may have been cancelled in the meantime
            let _ = tx.send(result);
        }
        .boxed();

        let queue = match kind {
            QueueKind::Explorer => &self.explorer,
            QueueKind::Rpc => &self.rpc,
        };
        if queue.tx.send(job).is_err() {
            unreachable!("scheduler dispatcher terminated while the limiter is alive");
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => unreachable!("scheduler dropped a job without running it"),
        }
    }
}
