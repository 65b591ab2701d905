//! Single-consumer task queue that owns the engine state.
//!
//! Every engine-touching operation is a closure submitted here. One worker
//! thread owns the state `S`, runs closures strictly in submission order and
//! reports each result through a completion callback. Because nothing else
//! can reach `S`, the program cache, the uniform store and the engine need no
//! locks of their own.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use shaderlink_core::{DispatchError, ShaderlinkError, ShaderlinkResult};

/// A queued unit of work. `None` means the task was abandoned at shutdown.
type Job<S> = Box<dyn FnOnce(Option<&mut S>) + Send + 'static>;

enum Message<S> {
    Run(Job<S>),
    Shutdown(ShutdownMode),
}

/// What happens to tasks still queued when shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run every queued task, then stop.
    Drain,
    /// Complete every queued task with `DispatchError::Abandoned`, then stop.
    Abandon,
}

/// Handle to the engine thread.
pub struct Dispatcher<S> {
    /// Held while checking `closed` and sending, so nothing can be queued
    /// behind the shutdown message.
    tx: Mutex<mpsc::Sender<Message<S>>>,
    closed: AtomicBool,
    /// Set before an `Abandon` shutdown so the worker skips whatever is
    /// still queued ahead of the shutdown message.
    abandon: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> Dispatcher<S> {
    /// Start the worker thread and build the state on it.
    ///
    /// `init` runs on the worker so the state never crosses a thread
    /// boundary. Returns once `init` has finished; if it failed, the worker
    /// has already been joined.
    pub fn spawn<F>(name: &str, init: F) -> ShaderlinkResult<Self>
    where
        F: FnOnce() -> ShaderlinkResult<S> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Message<S>>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<ShaderlinkResult<()>>(1);
        let abandon = Arc::new(AtomicBool::new(false));
        let worker_abandon = abandon.clone();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let state = match init() {
                    Ok(state) => {
                        let _ = ready_tx.send(Ok(()));
                        state
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_worker(state, rx, &worker_abandon);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!("engine thread '{}' started", name);
                Ok(Self {
                    tx: Mutex::new(tx),
                    closed: AtomicBool::new(false),
                    abandon,
                    worker: Mutex::new(Some(worker)),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let reason = match worker.join() {
                    Err(payload) => panic_message(payload.as_ref()),
                    Ok(()) => "engine thread exited during startup".to_string(),
                };
                Err(DispatchError::TaskPanicked(reason).into())
            }
        }
    }

    /// Queue `task`; `on_complete` runs on the engine thread with its result.
    ///
    /// Returns immediately. Fails only when the dispatcher is shut down, in
    /// which case neither closure runs. Once accepted, `on_complete` runs
    /// exactly once.
    pub fn submit<T, F, C>(&self, task: F, on_complete: C) -> Result<(), DispatchError>
    where
        T: 'static,
        F: FnOnce(&mut S) -> ShaderlinkResult<T> + Send + 'static,
        C: FnOnce(ShaderlinkResult<T>) + Send + 'static,
    {
        let tx = self.tx.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }

        let job: Job<S> = Box::new(move |state: Option<&mut S>| {
            let result = match state {
                Some(state) => match panic::catch_unwind(AssertUnwindSafe(|| task(state))) {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("engine task panicked: {}", message);
                        Err(DispatchError::TaskPanicked(message).into())
                    }
                },
                None => Err(DispatchError::Abandoned.into()),
            };
            on_complete(result);
        });

        tx.send(Message::Run(job)).map_err(|_| DispatchError::Closed)
    }

    /// Run `task` on the engine thread and await its result.
    pub async fn call<T, F>(&self, task: F) -> ShaderlinkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> ShaderlinkResult<T> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(task, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await
            .unwrap_or_else(|_| Err(ShaderlinkError::from(DispatchError::Closed)))
    }

    /// Run `task` on the engine thread and block until it finishes.
    ///
    /// Must not be called from the engine thread itself.
    pub fn call_blocking<T, F>(&self, task: F) -> ShaderlinkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> ShaderlinkResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(task, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv()
            .unwrap_or_else(|_| Err(ShaderlinkError::from(DispatchError::Closed)))
    }

    /// Stop the worker once the running task finishes and join it.
    ///
    /// Idempotent: later calls return immediately.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        {
            let tx = self.tx.lock();
            self.closed.store(true, Ordering::SeqCst);
            if mode == ShutdownMode::Abandon {
                self.abandon.store(true, Ordering::SeqCst);
            }
            let _ = tx.send(Message::Shutdown(mode));
        }

        if worker.thread().id() == thread::current().id() {
            // Shutdown requested by a task; the worker exits after it returns.
            return;
        }
        if worker.join().is_err() {
            tracing::error!("engine thread panicked during shutdown");
        }
        tracing::debug!("engine thread stopped ({:?})", mode);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<S> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.tx.get_mut().send(Message::Shutdown(ShutdownMode::Drain));
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker<S>(mut state: S, rx: mpsc::Receiver<Message<S>>, abandon: &AtomicBool) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) if abandon.load(Ordering::SeqCst) => abandon_job(job),
            Message::Run(job) => run_job(job, &mut state),
            Message::Shutdown(mode) => {
                while let Ok(message) = rx.try_recv() {
                    if let Message::Run(job) = message {
                        match mode {
                            ShutdownMode::Drain => run_job(job, &mut state),
                            ShutdownMode::Abandon => abandon_job(job),
                        }
                    }
                }
                break;
            }
        }
    }
}

fn run_job<S>(job: Job<S>, state: &mut S) {
    // Task panics are handled inside the job; this guards the completion
    // callback so the worker outlives a misbehaving caller.
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(Some(state)))) {
        tracing::error!(
            "completion callback panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

fn abandon_job<S>(job: Job<S>) {
    if panic::catch_unwind(AssertUnwindSafe(|| job(None))).is_err() {
        tracing::error!("completion callback panicked while abandoning a task");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
