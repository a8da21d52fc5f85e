//! Readiness notification for docks and connections.
//!
//! The [ConnectionManager] does not wait for input itself. A [ChannelManager] watches docks
//!  and connections and reports them as they become ready; the [EventLoop] feeds those
//!  reports to the connection manager one at a time. All protocol callbacks therefore run
//!  sequentially on the task that runs the event loop.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport::dock::Dock;
use transport::stream::Stream;
use crate::conn::{ConnectionId, ConnectionManager};

/// pause after a failed accept, e.g. when the process ran out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[cfg_attr(test, automock)]
pub trait ChannelManager: Send + Sync + 'static {
    fn manage_dock(&mut self, dock: Arc<Dock>);
    fn unmanage_docks(&mut self);
    fn manage_channel(&mut self, id: ConnectionId, stream: Arc<Stream>);
    fn unmanage_channel(&mut self, id: ConnectionId);
}

#[derive(Debug)]
pub enum Event {
    Accepted { stream: Stream, peer: IpAddr },
    /// The watcher waits for `done` before it looks at the stream again, so that it does not
    ///  report data the connection manager is about to consume anyway
    Readable { id: ConnectionId, done: oneshot::Sender<()> },
}

/// A [ChannelManager] that watches each dock and connection in a task of its own, and the
///  [EventLoop] that receives their reports
pub fn tokio_channel_manager() -> (TokioChannelManager, EventLoop) {
    let (send, recv) = mpsc::unbounded_channel();
    let channel_manager = TokioChannelManager {
        events: send,
        dock_watchers: Vec::new(),
        channel_watchers: FxHashMap::default(),
    };
    (channel_manager, EventLoop { events: recv })
}

pub struct TokioChannelManager {
    events: mpsc::UnboundedSender<Event>,
    dock_watchers: Vec<JoinHandle<()>>,
    channel_watchers: FxHashMap<ConnectionId, JoinHandle<()>>,
}

impl ChannelManager for TokioChannelManager {
    fn manage_dock(&mut self, dock: Arc<Dock>) {
        let events = self.events.clone();
        self.dock_watchers.push(tokio::spawn(async move {
            loop {
                match dock.accept().await {
                    Ok((stream, peer)) => {
                        trace!("accepted connection from {}", peer);
                        if events.send(Event::Accepted { stream, peer }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("error accepting connection on {:?} dock: {}", dock.family(), e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }));
    }

    fn unmanage_docks(&mut self) {
        for watcher in self.dock_watchers.drain(..) {
            watcher.abort();
        }
    }

    fn manage_channel(&mut self, id: ConnectionId, stream: Arc<Stream>) {
        let events = self.events.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let broken = stream.readable().await.is_err();

                let (done, processed) = oneshot::channel();
                if events.send(Event::Readable { id, done }).is_err() {
                    break;
                }
                // a broken stream is reported once, reading it makes the connection close
                if broken || processed.await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.channel_watchers.insert(id, watcher) {
            previous.abort();
        }
    }

    fn unmanage_channel(&mut self, id: ConnectionId) {
        if let Some(watcher) = self.channel_watchers.remove(&id) {
            watcher.abort();
        }
    }
}

impl Drop for TokioChannelManager {
    fn drop(&mut self) {
        self.unmanage_docks();
        for (_, watcher) in self.channel_watchers.drain() {
            watcher.abort();
        }
    }
}

pub struct EventLoop {
    events: mpsc::UnboundedReceiver<Event>,
}

impl EventLoop {
    /// Waits for the next event and hands it to the connection manager. Returns `false` if
    ///  there are no event sources left.
    ///
    /// Errors are [transport::error::Fatal]: the connection manager handles everything else
    ///  by closing the affected connection.
    pub async fn run_once(&mut self, mgr: &mut ConnectionManager) -> anyhow::Result<bool> {
        match self.events.recv().await {
            None => Ok(false),
            Some(Event::Accepted { stream, peer }) => {
                mgr.on_accept(stream, peer).await?;
                Ok(true)
            }
            Some(Event::Readable { id, done }) => {
                mgr.on_readable(id).await?;
                let _ = done.send(());
                Ok(true)
            }
        }
    }

    /// Processes events until exit is requested (see [ConnectionManager::request_exit])
    pub async fn run(&mut self, mgr: &mut ConnectionManager) -> anyhow::Result<()> {
        while !mgr.exit_requested() {
            if !self.run_once(mgr).await? {
                debug!("no event sources left");
                break;
            }
        }
        Ok(())
    }
}
