//! Threaded runtime.
//!
//! One worker thread per CPU, each owning that CPU's pantry. Wake-ups
//! travel over a per-worker channel; a worker that sits idle for longer
//! than the GRO flush interval runs the time-budget flush on its own.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineBuilder, Verdict};
use crate::error::Result;
use crate::notify::{Event, Signal};
use crate::packet::Packet;

/// Signal backed by one unbounded channel per CPU.
#[derive(Debug)]
pub struct ChannelSignal {
    senders: Vec<Sender<Event>>,
}

impl ChannelSignal {
    /// Creates the channels and returns the receiving ends, indexed by CPU.
    #[must_use]
    pub fn new(nr_cpus: usize) -> (Self, Vec<Receiver<Event>>) {
        let (senders, receivers) = (0..nr_cpus).map(|_| crossbeam_channel::unbounded()).unzip();
        (Self { senders }, receivers)
    }
}

impl Signal for ChannelSignal {
    fn raise(&self, cpu: usize, event: Event) {
        if let Some(tx) = self.senders.get(cpu) {
            // A closed channel means the worker is gone; nothing to wake.
            let _ = tx.send(event);
        }
    }
}

/// Engine plus one worker thread per CPU.
pub struct Runtime {
    engine: Arc<Engine>,
    signal: Arc<ChannelSignal>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Runtime {
    /// Builds the engine with a channel signal and starts the workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be built or a thread cannot
    /// be spawned.
    pub fn start(builder: EngineBuilder) -> Result<Self> {
        let nr_cpus = builder.config().nr_cpus;
        let (signal, receivers) = ChannelSignal::new(nr_cpus);
        let signal = Arc::new(signal);
        let engine = Arc::new(builder.signal(signal.clone()).build()?);

        let idle = match engine.config().gro_flush_interval_ns {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        };

        let mut runtime = Self {
            engine,
            signal,
            workers: Vec::with_capacity(nr_cpus),
        };
        for (cpu, rx) in receivers.into_iter().enumerate() {
            let engine = Arc::clone(&runtime.engine);
            let handle = thread::Builder::new()
                .name(format!("mcps-cpu{cpu}"))
                .spawn(move || worker(&engine, cpu, &rx, idle))?;
            runtime.workers.push(handle);
        }

        info!(workers = runtime.workers.len(), "runtime started");
        Ok(runtime)
    }

    /// Shared engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Submits a packet as if it arrived on `local_cpu`.
    pub fn submit(&self, local_cpu: usize, pkt: Packet) -> Verdict {
        self.engine.submit(local_cpu, pkt)
    }

    /// Returns true once no pantry has queued or scheduled work and no
    /// notification is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let engine = &self.engine;
        (0..engine.nr_cpus()).all(|cpu| {
            engine.notifier().pending_len(cpu) == 0
                && engine
                    .pantry(cpu)
                    .map_or(true, |p| !p.is_scheduled() && p.queued() == 0)
        })
    }

    /// Waits until [`is_idle`](Self::is_idle) or `timeout` passes. Returns
    /// true if the runtime went idle.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for cpu in 0..self.workers.len() {
            self.signal.raise(cpu, Event::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        self.engine.shutdown();
    }

    /// Stops every worker and shuts the engine down.
    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(engine: &Engine, cpu: usize, rx: &Receiver<Event>, idle: Option<Duration>) {
    debug!(cpu, "worker started");
    loop {
        let event = match idle {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match event {
            Ok(Event::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(event) => {
                if let Err(e) = engine.handle(cpu, event) {
                    warn!(cpu, error = %e, "event failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = engine.flush_expired(cpu) {
                    warn!(cpu, error = %e, "idle flush failed");
                }
            }
        }
    }
    debug!(cpu, "worker stopped");
}
