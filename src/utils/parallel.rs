use futures::{stream::FuturesUnordered, StreamExt};
use snafu::{prelude::*, IntoError};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    runtime::{Builder, Handle, Runtime, RuntimeFlavor},
    task::{self, JoinError, JoinHandle},
};

use super::lazy_rw_lock::{new_lazy_fill_rw_lock, LazyFillError, LazyFillRwLock, RwLock};
use crate::{IoSnafu, Result, RuntimeSnafu};

static RUNTIME: RwLock<Option<Runtime>> = new_lazy_fill_rw_lock();

/// The ambient tokio runtime, or a shared one created on first use.
///
/// An ambient current-thread runtime can't be blocked on, so it is rejected.
pub fn runtime_handle() -> Result<Handle> {
    if let Ok(handle) = Handle::try_current() {
        ensure!(
            handle.runtime_flavor() != RuntimeFlavor::CurrentThread,
            RuntimeSnafu {
                description: "results can't be awaited from inside a current-thread runtime",
            }
        );
        return Ok(handle);
    }
    RUNTIME
        .get_or_try_load(
            |rt| rt.handle().clone(),
            || Builder::new_multi_thread().enable_all().build(),
        )
        .map_err(|e| match e {
            LazyFillError::Poisoned => RuntimeSnafu {
                description: "the shared runtime lock was poisoned",
            }
            .build(),
            LazyFillError::Load(source) => IoSnafu {
                context: "starting the worker runtime",
            }
            .into_error(source),
        })
}

/// In which order results leave a [ParallelMapper].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Whatever finishes first is handed out first.
    CompletionOrder,
    /// Results come out in input order, however the workers finish.
    SourceOrder,
}

/// Runs a worker function over a sequence with a bounded number of items in flight.
///
/// Workers run on tokio's blocking pool; results are handed to the (single) caller
/// of the returned iterator. Inside a multi-thread runtime the caller's worker
/// thread is handed over to blocking while it waits.
pub struct ParallelMapper {
    handle: Handle,
    concurrency: usize,
}

impl ParallelMapper {
    pub fn new(concurrency: usize) -> Result<Self> {
        Ok(Self::with_handle(runtime_handle()?, concurrency))
    }

    pub fn with_handle(handle: Handle, concurrency: usize) -> Self {
        ParallelMapper {
            handle,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Apply `worker` to every item of `input`.
    ///
    /// Input is only pulled when a slot is free, so at most `concurrency` items
    /// are being worked on or waiting to be emitted at any time.
    /// The first error ends the sequence and cancels everything still in flight.
    pub fn map<I, F, R, E>(
        &self,
        input: I,
        delivery: Delivery,
        worker: F,
    ) -> MappedResults<I::IntoIter, R, E, F>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Send + 'static,
        E: From<JoinError> + Send + 'static,
    {
        let in_flight = match delivery {
            Delivery::SourceOrder => InFlight::SourceOrder(VecDeque::with_capacity(self.concurrency)),
            Delivery::CompletionOrder => InFlight::CompletionOrder(FuturesUnordered::new()),
        };
        MappedResults {
            handle: self.handle.clone(),
            input: input.into_iter(),
            worker: Arc::new(worker),
            in_flight,
            concurrency: self.concurrency,
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: false,
        }
    }
}

/// `None` marks a task that saw the cancellation flag before starting.
type TaskOutput<R, E> = Option<std::result::Result<R, E>>;

enum InFlight<Out> {
    SourceOrder(VecDeque<JoinHandle<Out>>),
    CompletionOrder(FuturesUnordered<JoinHandle<Out>>),
}

impl<Out> InFlight<Out> {
    fn len(&self) -> usize {
        match self {
            InFlight::SourceOrder(queue) => queue.len(),
            InFlight::CompletionOrder(set) => set.len(),
        }
    }

    fn push(&mut self, task: JoinHandle<Out>) {
        match self {
            InFlight::SourceOrder(queue) => queue.push_back(task),
            InFlight::CompletionOrder(set) => set.push(task),
        }
    }

    /// Block until the next task in delivery order is done.
    fn next(&mut self, handle: &Handle) -> Option<std::result::Result<Out, JoinError>> {
        match self {
            InFlight::SourceOrder(queue) => queue.pop_front().map(|task| block_on(handle, task)),
            InFlight::CompletionOrder(set) => block_on(handle, set.next()),
        }
    }

    fn abort_all(&mut self) {
        match self {
            InFlight::SourceOrder(queue) => {
                for task in queue.drain(..) {
                    task.abort();
                }
            }
            InFlight::CompletionOrder(set) => {
                for task in set.iter() {
                    task.abort();
                }
                set.clear();
            }
        }
    }
}

fn block_on<T>(handle: &Handle, future: impl std::future::Future<Output = T>) -> T {
    if Handle::try_current().is_ok() {
        task::block_in_place(|| handle.block_on(future))
    } else {
        handle.block_on(future)
    }
}

/// The blocking iterator returned by [ParallelMapper::map].
pub struct MappedResults<I, R, E, F> {
    handle: Handle,
    input: I,
    worker: Arc<F>,
    in_flight: InFlight<TaskOutput<R, E>>,
    concurrency: usize,
    cancelled: Arc<AtomicBool>,
    finished: bool,
}

impl<I, R, E, F> MappedResults<I, R, E, F> {
    fn cancel(&mut self) {
        self.finished = true;
        self.cancelled.store(true, Ordering::Release);
        self.in_flight.abort_all();
    }
}

impl<I, R, E, F> MappedResults<I, R, E, F>
where
    I: Iterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> std::result::Result<R, E> + Send + Sync + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    fn fill(&mut self) {
        while self.in_flight.len() < self.concurrency {
            let Some(item) = self.input.next() else {
                break;
            };
            let worker = Arc::clone(&self.worker);
            let cancelled = Arc::clone(&self.cancelled);
            let task = self.handle.spawn_blocking(move || {
                if cancelled.load(Ordering::Acquire) {
                    None
                } else {
                    Some(worker(item))
                }
            });
            self.in_flight.push(task);
        }
    }
}

impl<I, R, E, F> Iterator for MappedResults<I, R, E, F>
where
    I: Iterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> std::result::Result<R, E> + Send + Sync + 'static,
    R: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    type Item = std::result::Result<R, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            self.fill();
            let Some(joined) = self.in_flight.next(&self.handle) else {
                self.finished = true;
                return None;
            };
            let result = match joined {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => Err(E::from(e)),
            };
            if result.is_err() {
                self.cancel();
            }
            return Some(result);
        }
    }
}

impl<I, R, E, F> Drop for MappedResults<I, R, E, F> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

/// Split `items` into exactly `count` runs of consecutive items.
///
/// Sizes differ by at most one, earlier partitions being the larger ones.
pub fn partition<T>(items: impl IntoIterator<Item = T>, count: usize) -> Vec<Vec<T>> {
    if count == 0 {
        return Vec::new();
    }
    let items: Vec<T> = items.into_iter().collect();
    let base = items.len() / count;
    let extra = items.len() % count;
    let mut rest = items.into_iter();
    (0..count)
        .map(|i| {
            let size = base + usize::from(i < extra);
            rest.by_ref().take(size).collect()
        })
        .collect()
}
