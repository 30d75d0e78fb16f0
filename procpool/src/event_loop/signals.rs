//! Routes process signals to a pool's event loop.
//!
//! The bridge owns a thread running a current-thread tokio runtime that
//! listens on `tokio::signal::unix` streams and forwards each delivery as an
//! [`Event::Signal`]. Once a signal kind has been listened to, tokio keeps its
//! handler installed for the rest of the process.

use std::io;
use std::thread::{self, JoinHandle};

use procpool_api::{PoolError, Result};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::event::{Event, PoolSignal};

/// Running signal bridge; stopped on drop.
#[derive(Debug)]
pub struct SignalBridge {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

struct Streams {
    terminate: Signal,
    interrupt: Signal,
    child: Signal,
    user1: Signal,
    user2: Signal,
}

impl Streams {
    fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            child: signal(SignalKind::child())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
        })
    }
}

impl SignalBridge {
    /// Installs the handlers and starts forwarding. Returns once the handlers
    /// are in place.
    pub fn start(pool_name: &str, events: flume::Sender<Event>) -> Result<Self> {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = flume::bounded::<Result<()>>(1);
        let name = pool_name.to_string();

        let thread = thread::Builder::new()
            .name(format!("{}-signals", pool_name))
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(PoolError::syscall("build signal runtime", err)));
                        return;
                    }
                };
                runtime.block_on(forward(name, events, ready_tx, stop_rx));
            })
            .map_err(|err| PoolError::syscall("spawn signal bridge", err))?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(PoolError::Other(anyhow::anyhow!("signal bridge exited during setup")))
        });
        match ready {
            Ok(()) => Ok(Self { stop: Some(stop_tx), thread: Some(thread) }),
            Err(err) => {
                let _ = thread.join();
                Err(err)
            }
        }
    }

    /// Stops forwarding and joins the bridge thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn forward(
    pool_name: String,
    events: flume::Sender<Event>,
    ready: flume::Sender<Result<()>>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut streams = match Streams::install() {
        Ok(streams) => streams,
        Err(err) => {
            let _ = ready.send(Err(PoolError::syscall("install signal handlers", err)));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("[{}] Signal bridge listening", pool_name);

    loop {
        let signal = tokio::select! {
            _ = &mut stop => break,
            Some(()) = streams.terminate.recv() => PoolSignal::Terminate,
            Some(()) = streams.interrupt.recv() => PoolSignal::Interrupt,
            Some(()) = streams.child.recv() => PoolSignal::ChildExited,
            Some(()) = streams.user1.recv() => PoolSignal::DumpStats,
            Some(()) = streams.user2.recv() => PoolSignal::ToggleDebug,
            else => break,
        };

        match signal {
            PoolSignal::Terminate | PoolSignal::Interrupt => {
                info!("[{}] Received {:?}, stopping", pool_name, signal)
            }
            _ => debug!("[{}] Received {:?}", pool_name, signal),
        }
        if events.send(Event::Signal(signal)).is_err() {
            break;
        }
    }
    debug!("[{}] Signal bridge stopped", pool_name);
}
