// ========== Daemon Engine ==========

use async_trait::async_trait;
use ess_lib::EssResult;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::HashSet;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Process-wide graceful stop flag, shared by control loops and workers.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("stop signal raised");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleeps `dur` unless stopped first. Returns whether the stop was raised.
    pub async fn sleep(&self, dur: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => true,
            _ = tokio::time::sleep(dur) => self.is_stopped(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub num_workers: usize,
    pub task_queue_size: usize,
    pub result_queue_size: usize,
    /// Fixed control-loop period; when unset the loop alternates busy/idle intervals.
    pub poll_interval: Option<Duration>,
    pub busy_interval: Duration,
    pub idle_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            num_workers: 1,
            task_queue_size: 100,
            result_queue_size: 100,
            poll_interval: None,
            busy_interval: Duration::from_millis(2000),
            idle_interval: Duration::from_millis(4000),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// The hooks one daemon plugs into the engine.
///
/// `discover_tasks` and `collect_results` only ever run on the control loop, one call
/// at a time; `process_task` runs on the workers.
#[async_trait]
pub trait DaemonTasks: Send + Sync + 'static {
    type Task: Send + Debug + 'static;

    fn name(&self) -> &str;

    /// Runs before any worker starts. An error here stops the daemon.
    async fn on_start(&self) -> EssResult<()> {
        Ok(())
    }

    async fn on_stop(&self) {}

    /// Tasks sharing a key are never queued twice while one is in flight.
    fn task_key(&self, _task: &Self::Task) -> Option<String> {
        None
    }

    /// At most `capacity` tasks are expected back.
    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<Self::Task>>;

    async fn process_task(&self, task: &mut Self::Task) -> EssResult<()>;

    /// Receives every task a worker picked up, whether `process_task` succeeded or not.
    async fn collect_results(&self, results: Vec<Self::Task>) -> EssResult<()>;

    /// Tasks discovered but never processed because the daemon is stopping.
    async fn release_tasks(&self, _tasks: Vec<Self::Task>) {}
}

struct TaskResult<T> {
    task: T,
    processed: bool,
}

#[derive(Default)]
struct InFlight {
    keys: HashSet<String>,
    count: usize,
}

pub struct DaemonEngine<D: DaemonTasks> {
    daemon: Arc<D>,
    options: EngineOptions,
    stop: StopSignal,
}

impl<D: DaemonTasks> DaemonEngine<D> {
    pub fn new(daemon: Arc<D>, options: EngineOptions, stop: StopSignal) -> Self {
        Self {
            daemon,
            options,
            stop,
        }
    }

    pub async fn run(self) -> EssResult<()> {
        let name = self.daemon.name().to_string();
        if let Err(e) = self.daemon.on_start().await {
            error!("{}: start failed: {}", name, e);
            return Err(e);
        }

        let num_workers = self.options.num_workers.max(1);
        info!(
            "{}: engine started: workers={}, task_queue_size={}, result_queue_size={}, poll_interval={:?}",
            name,
            num_workers,
            self.options.task_queue_size,
            self.options.result_queue_size,
            self.options.poll_interval
        );

        let (task_tx, task_rx) = mpsc::channel::<D::Task>(self.options.task_queue_size.max(1));
        let (result_tx, mut result_rx) =
            mpsc::channel::<TaskResult<D::Task>>(self.options.result_queue_size.max(1));
        let task_rx = Arc::new(AsyncMutex::new(task_rx));
        let workers = (0..num_workers)
            .map(|index| {
                Self::spawn_worker(
                    self.daemon.clone(),
                    index,
                    task_rx.clone(),
                    result_tx.clone(),
                    self.stop.clone(),
                )
            })
            .collect::<Vec<_>>();
        drop(result_tx);

        let mut in_flight = InFlight::default();
        while !self.stop.is_stopped() {
            let busy = self.run_cycle(&task_tx, &mut result_rx, &mut in_flight).await;
            let interval = match self.options.poll_interval {
                Some(interval) => interval,
                None if busy => self.options.busy_interval,
                None => self.options.idle_interval,
            };
            if self.stop.sleep(interval).await {
                break;
            }
        }

        info!(
            "{}: stopping: in_flight={}, drain_timeout={:?}",
            name, in_flight.count, self.options.drain_timeout
        );
        drop(task_tx);
        let mut done = Vec::new();
        let mut skipped = Vec::new();
        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(result) = result_rx.recv().await {
                if result.processed {
                    done.push(result.task);
                } else {
                    skipped.push(result.task);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{}: workers did not drain within {:?}, aborting them",
                name, self.options.drain_timeout
            );
            for worker in &workers {
                worker.abort();
            }
        }

        if !done.is_empty() {
            self.collect(done).await;
        }
        if !skipped.is_empty() {
            info!("{}: releasing {} unprocessed tasks", name, skipped.len());
            self.daemon.release_tasks(skipped).await;
        }
        self.daemon.on_stop().await;
        info!("{}: engine stopped", name);
        Ok(())
    }

    /// One control-loop pass: collect finished tasks, then discover new ones.
    /// Returns whether there was anything to do.
    async fn run_cycle(
        &self,
        task_tx: &mpsc::Sender<D::Task>,
        result_rx: &mut mpsc::Receiver<TaskResult<D::Task>>,
        in_flight: &mut InFlight,
    ) -> bool {
        let mut busy = false;

        let mut done = Vec::new();
        let mut skipped = Vec::new();
        while let Ok(result) = result_rx.try_recv() {
            in_flight.count = in_flight.count.saturating_sub(1);
            if let Some(key) = self.daemon.task_key(&result.task) {
                in_flight.keys.remove(&key);
            }
            if result.processed {
                done.push(result.task);
            } else {
                skipped.push(result.task);
            }
        }
        if !done.is_empty() {
            busy = true;
            self.collect(done).await;
        }
        if !skipped.is_empty() {
            self.daemon.release_tasks(skipped).await;
        }

        let capacity = task_tx.capacity();
        if capacity == 0 || self.stop.is_stopped() {
            return true;
        }

        let discovered = AssertUnwindSafe(self.daemon.discover_tasks(capacity))
            .catch_unwind()
            .await;
        let tasks = match discovered {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => {
                error!("{}: discover tasks failed: {}", self.daemon.name(), e);
                return busy || in_flight.count > 0;
            }
            Err(panic) => {
                error!(
                    "{}: discover tasks panicked: {}",
                    self.daemon.name(),
                    panic_message(&*panic)
                );
                return busy || in_flight.count > 0;
            }
        };

        let mut rejected = Vec::new();
        for task in tasks {
            let key = self.daemon.task_key(&task);
            if let Some(key) = &key {
                if in_flight.keys.contains(key) {
                    debug!("{}: task already in flight: key={}", self.daemon.name(), key);
                    continue;
                }
            }
            match task_tx.try_send(task) {
                Ok(()) => {
                    busy = true;
                    in_flight.count += 1;
                    if let Some(key) = key {
                        in_flight.keys.insert(key);
                    }
                }
                Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                    rejected.push(task);
                }
            }
        }
        if !rejected.is_empty() {
            warn!(
                "{}: task queue full, releasing {} tasks",
                self.daemon.name(),
                rejected.len()
            );
            self.daemon.release_tasks(rejected).await;
        }

        busy || in_flight.count > 0
    }

    async fn collect(&self, results: Vec<D::Task>) {
        let count = results.len();
        match AssertUnwindSafe(self.daemon.collect_results(results))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => debug!("{}: collected {} results", self.daemon.name(), count),
            Ok(Err(e)) => error!("{}: collect results failed: {}", self.daemon.name(), e),
            Err(panic) => error!(
                "{}: collect results panicked: {}",
                self.daemon.name(),
                panic_message(&*panic)
            ),
        }
    }

    fn spawn_worker(
        daemon: Arc<D>,
        index: usize,
        tasks: Arc<AsyncMutex<mpsc::Receiver<D::Task>>>,
        results: mpsc::Sender<TaskResult<D::Task>>,
        stop: StopSignal,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut rx = tasks.lock().await;
                    rx.recv().await
                };
                let Some(mut task) = next else {
                    break;
                };

                let processed = !stop.is_stopped();
                if processed {
                    let outcome = AssertUnwindSafe(daemon.process_task(&mut task))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            "{}: worker {} task failed: task={:?}, err={}",
                            daemon.name(),
                            index,
                            task,
                            e
                        ),
                        Err(panic) => error!(
                            "{}: worker {} task panicked: task={:?}, panic={}",
                            daemon.name(),
                            index,
                            task,
                            panic_message(&*panic)
                        ),
                    }
                }

                if results.send(TaskResult { task, processed }).await.is_err() {
                    break;
                }
            }
            debug!("{}: worker {} exited", daemon.name(), index);
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
