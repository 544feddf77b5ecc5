//! Collection pipeline.
//!
//! Three long-lived workers move values from sources to destinations:
//!
//! - the reader polls every source once per interval and pushes what it gets onto a bounded queue
//! - the writer drains the queue once per interval, applies rate conversion, and hands the batch to every destination
//! - the sweeper expires stale rate state
//!
//! All three share a single cancellation token, and stop at their next await point once it is cancelled.

use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use futures::FutureExt as _;
use hostpulse_error::{generic_error, GenericError};
use tokio::{
    select,
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::TypeCatalog,
    data_model::CollectableValue,
    plugin::PluginSet,
    queue::BoundedQueue,
    rate::RateAggregator,
};

mod config;
pub use self::config::PipelineConfiguration;

/// Lifecycle state of a pipeline worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    /// Not yet started.
    Idle,

    /// Running cycles.
    Running,

    /// Asked to stop, but has not yet exited.
    Stopping,

    /// Exited.
    Stopped,
}

/// A pipeline worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Worker {
    /// Polls sources.
    Reader,

    /// Delivers to destinations.
    Writer,

    /// Expires rate state.
    Sweeper,
}

impl Worker {
    const ALL: [Worker; 3] = [Worker::Reader, Worker::Writer, Worker::Sweeper];

    const fn index(self) -> usize {
        match self {
            Worker::Reader => 0,
            Worker::Writer => 1,
            Worker::Sweeper => 2,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Worker::Reader => "reader",
            Worker::Writer => "writer",
            Worker::Sweeper => "sweeper",
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Shared {
    config: PipelineConfiguration,
    queue: BoundedQueue<CollectableValue>,
    plugins: ArcSwap<PluginSet>,
    rates: RateAggregator,
    states: [watch::Sender<WorkerState>; 3],
}

impl Shared {
    fn set_state(&self, worker: Worker, state: WorkerState) {
        self.states[worker.index()].send_replace(state);
    }
}

struct RunningWorkers {
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The collection pipeline.
pub struct Pipeline {
    shared: Arc<Shared>,
    running: Mutex<Option<RunningWorkers>>,
}

impl Pipeline {
    /// Creates a new `Pipeline` over the given plugins.
    pub fn new(config: PipelineConfiguration, catalog: Arc<TypeCatalog>, plugins: PluginSet) -> Self {
        let rates = RateAggregator::new(config.timeout(), config.store_rates(), catalog);
        let queue = BoundedQueue::new(config.max_queue_size());

        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                plugins: ArcSwap::from_pointee(plugins),
                rates,
                states: [
                    watch::Sender::new(WorkerState::Idle),
                    watch::Sender::new(WorkerState::Idle),
                    watch::Sender::new(WorkerState::Idle),
                ],
            }),
            running: Mutex::new(None),
        }
    }

    /// Returns the current state of the given worker.
    pub fn worker_state(&self, worker: Worker) -> WorkerState {
        *self.shared.states[worker.index()].borrow()
    }

    /// Returns a receiver that observes state changes of the given worker.
    pub fn watch_worker_state(&self, worker: Worker) -> watch::Receiver<WorkerState> {
        self.shared.states[worker.index()].subscribe()
    }

    /// Returns the number of values waiting to be written.
    pub fn queued_values(&self) -> usize {
        self.shared.queue.len()
    }

    /// Returns the rate aggregator.
    pub fn rate_aggregator(&self) -> &RateAggregator {
        &self.shared.rates
    }

    /// Configures every plugin.
    ///
    /// # Errors
    ///
    /// If any plugin fails to configure, an error is returned.
    pub async fn configure_all(&self) -> Result<(), GenericError> {
        self.shared.plugins.load_full().configure_all().await
    }

    /// Starts every plugin, then launches the reader, writer and sweeper.
    ///
    /// # Errors
    ///
    /// If the pipeline is already running, or any plugin fails to start, an error is returned.
    pub async fn start_all(&self) -> Result<(), GenericError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(generic_error!("Pipeline is already running."));
        }

        self.shared.plugins.load_full().start_all().await?;

        let cancel_token = CancellationToken::new();
        let handles = Worker::ALL
            .into_iter()
            .map(|worker| {
                self.shared.set_state(worker, WorkerState::Running);

                let shared = Arc::clone(&self.shared);
                let token = cancel_token.clone();
                tokio::spawn(async move {
                    match worker {
                        Worker::Reader => run_reader(&shared, &token).await,
                        Worker::Writer => run_writer(&shared, &token).await,
                        Worker::Sweeper => run_sweeper(&shared, &token).await,
                    }
                    debug!(%worker, "Worker stopped.");
                    shared.set_state(worker, WorkerState::Stopped);
                })
            })
            .collect();

        *running = Some(RunningWorkers { cancel_token, handles });
        info!(
            interval_secs = self.shared.config.interval().as_secs(),
            "Pipeline started."
        );
        Ok(())
    }

    /// Stops the workers, waits for them to exit, then stops every plugin.
    ///
    /// Cycles in progress are abandoned at their next await point, and values still queued are discarded.
    pub async fn stop_all(&self) {
        if let Some(RunningWorkers { cancel_token, handles }) = self.running.lock().await.take() {
            for worker in Worker::ALL {
                self.shared.set_state(worker, WorkerState::Stopping);
            }
            cancel_token.cancel();

            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Pipeline worker terminated abnormally.");
                }
            }
        }

        self.shared.plugins.load_full().stop_all().await;
        info!("Pipeline stopped.");
    }

    /// Replaces the plugin set.
    ///
    /// The new plugins are configured before anything else happens. If the pipeline is running, the current sources
    /// are stopped so that the new ones can claim any resources they hold, such as a listening port, and then the new
    /// plugins are started and swapped in. Each worker picks up the new set at the start of its next cycle. Values the
    /// previous sources collected but had not yet handed over are queued, and the previous destinations are stopped.
    ///
    /// # Errors
    ///
    /// If any new plugin fails to configure or start, an error is returned and the current plugins stay in place. If
    /// the failure happened after the current sources were stopped, they are started again.
    pub async fn reconfigure(&self, plugins: PluginSet) -> Result<(), GenericError> {
        let running = self.running.lock().await;

        plugins.configure_all().await?;
        if running.is_none() {
            self.shared.plugins.store(Arc::new(plugins));
            info!("Pipeline reconfigured.");
            return Ok(());
        }

        let current = self.shared.plugins.load_full();
        current.stop_sources().await;

        if let Err(e) = plugins.start_all().await {
            plugins.stop_all().await;
            if let Err(restart_error) = current.start_sources().await {
                error!(error = %restart_error, "Failed to restart sources after a failed reconfiguration.");
            }
            return Err(e);
        }

        let previous = self.shared.plugins.swap(Arc::new(plugins));
        for source in previous.sources() {
            match source.read().await {
                Ok(values) if !values.is_empty() => self.shared.queue.push_all(values),
                Ok(_) => {}
                Err(e) => warn!(source = source.name(), error = %e, "Failed to read from stopped source."),
            }
        }
        previous.stop_destinations().await;

        info!("Pipeline reconfigured.");
        Ok(())
    }
}

/// Runs `future`, converting a panic into an error message.
async fn catch_panic<F: Future>(future: F) -> Result<F::Output, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(&*payload))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sleeps for `duration`, returning `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    select! {
        _ = cancel_token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Returns how long to sleep until the end of the cycle that began at `started`, warning if the cycle nearly overran.
fn remaining_in_cycle(worker: Worker, started: Instant, interval: Duration) -> Duration {
    let elapsed = started.elapsed();
    if elapsed.as_secs_f64() > interval.as_secs_f64() * 0.9 {
        warn!(
            %worker,
            elapsed_secs = elapsed.as_secs_f64(),
            interval_secs = interval.as_secs(),
            "Cycle used most or all of its interval."
        );
    }
    interval.saturating_sub(elapsed)
}

async fn run_reader(shared: &Shared, cancel_token: &CancellationToken) {
    let interval = shared.config.interval();

    loop {
        let started = Instant::now();
        let plugins = shared.plugins.load_full();

        let mut had_error = false;
        for source in plugins.sources() {
            let read_started = Instant::now();
            match catch_panic(source.read()).await {
                Ok(Ok(values)) => {
                    debug!(
                        source = source.name(),
                        count = values.len(),
                        elapsed_secs = read_started.elapsed().as_secs_f64(),
                        "Read values."
                    );
                    if !values.is_empty() {
                        shared.queue.push_all(values);
                    }
                }
                Ok(Err(e)) => {
                    error!(source = source.name(), error = %e, "Failed to read from source.");
                    had_error = true;
                }
                Err(panic) => {
                    error!(source = source.name(), %panic, "Source panicked while reading.");
                    had_error = true;
                }
            }
        }

        let sleep_for = if had_error {
            interval
        } else {
            remaining_in_cycle(Worker::Reader, started, interval)
        };

        if !sleep_or_cancel(sleep_for, cancel_token).await {
            break;
        }
    }
}

async fn run_writer(shared: &Shared, cancel_token: &CancellationToken) {
    let interval = shared.config.interval();

    if !sleep_or_cancel(shared.config.writer_warmup(), cancel_token).await {
        return;
    }

    loop {
        let started = Instant::now();

        let mut had_error = false;
        let mut batch = shared.queue.drain();
        if !batch.is_empty() {
            for value in &mut batch {
                value.meta_mut().interval = interval.as_secs();
                if let CollectableValue::Metric(metric) = value {
                    shared.rates.aggregate(metric);
                }
            }

            let plugins = shared.plugins.load_full();
            for destination in plugins.destinations() {
                if let Err(panic) = catch_panic(destination.write(&batch)).await {
                    error!(destination = destination.name(), %panic, "Destination panicked while writing.");
                    had_error = true;
                }
            }

            debug!(
                count = batch.len(),
                elapsed_secs = started.elapsed().as_secs_f64(),
                "Wrote values."
            );
        }

        let sleep_for = if had_error {
            interval
        } else {
            remaining_in_cycle(Worker::Writer, started, interval)
        };
        if !sleep_or_cancel(sleep_for, cancel_token).await {
            break;
        }
    }
}

async fn run_sweeper(shared: &Shared, cancel_token: &CancellationToken) {
    let timeout = shared.rates.timeout();

    while sleep_or_cancel(timeout, cancel_token).await {
        shared.rates.remove_expired_entries();
    }
}
