use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data_message::parse_data_message;
use crate::destination::{Acceptor, StreamingDestination};
use crate::error::{Error, Result};
use crate::identity::{DestinationKeys, IdentHash};
use crate::lease::LeaseSet;
use crate::packet::Packet;
use crate::stream::StreamHandle;
use crate::transport::NetworkContext;

/// Work posted onto the dispatch loop.
///
/// Every mutation of destination and stream state happens by handling one of
/// these on the loop task; public entry points only enqueue.
pub(crate) enum Event {
    Inbound {
        destination: IdentHash,
        packet: Packet,
    },
    OpenStream {
        remote: Arc<LeaseSet>,
        reply: oneshot::Sender<StreamHandle>,
    },
    Send {
        destination: IdentHash,
        stream: u32,
        data: Bytes,
    },
    Drain {
        destination: IdentHash,
        stream: u32,
        max: usize,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Close {
        destination: IdentHash,
        stream: u32,
    },
    Delete {
        destination: IdentHash,
        stream: u32,
    },
    SetAcceptor {
        destination: IdentHash,
        acceptor: Acceptor,
    },
}

/// Configuration for [`StreamingRegistry::start`]
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Directory scanned for persisted `*.dat` destinations at startup
    pub data_dir: Option<PathBuf>,
}

/// Process root of the streaming layer: owns every local destination and the
/// dispatch loop they run on.
pub struct StreamingRegistry {
    events: mpsc::UnboundedSender<Event>,
    shared_destination: IdentHash,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingRegistry {
    /// Create the shared local destination, load persisted destinations from
    /// the data directory, and spawn the dispatch loop.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(config: RegistryConfig, network: NetworkContext) -> Result<Self> {
        let (events, rx) = mpsc::unbounded_channel();

        let shared =
            StreamingDestination::new(DestinationKeys::generate()?, network.clone(), events.clone());
        let shared_destination = shared.ident_hash();

        let mut destinations = HashMap::new();
        destinations.insert(shared_destination, shared);
        if let Some(dir) = &config.data_dir {
            load_local_destinations(dir, &network, &events, &mut destinations);
        }

        let cancel = CancellationToken::new();
        let state = DispatchState {
            destinations,
            shared: shared_destination,
        };
        let task = tokio::spawn(dispatch_loop(state, rx, cancel.clone()));

        info!(
            "streaming engine started, shared destination {}",
            shared_destination
        );
        Ok(Self {
            events,
            shared_destination,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop the dispatch loop; every destination and stream is dropped
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("streaming engine stopped");
    }

    /// Hash of the shared local destination used by client streams
    pub fn shared_local_destination(&self) -> IdentHash {
        self.shared_destination
    }

    /// Open an outgoing stream from the shared destination
    pub async fn create_stream(&self, remote: Arc<LeaseSet>) -> Result<StreamHandle> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::OpenStream { remote, reply })
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Unregister and destroy a stream
    pub fn delete_stream(&self, stream: &StreamHandle) -> Result<()> {
        self.events
            .send(Event::Delete {
                destination: stream.destination(),
                stream: stream.id(),
            })
            .map_err(|_| Error::Stopped)
    }

    /// Install the incoming-stream callback of a local destination
    pub fn set_acceptor(&self, destination: IdentHash, acceptor: Acceptor) -> Result<()> {
        self.events
            .send(Event::SetAcceptor {
                destination,
                acceptor,
            })
            .map_err(|_| Error::Stopped)
    }

    /// Substrate callback: one application-data message addressed to a local
    /// destination. Decompressed here on the caller; the resulting packet is
    /// moved onto the dispatch loop.
    pub fn handle_data_message(&self, destination: IdentHash, buf: &[u8]) {
        match parse_data_message(buf) {
            Ok(packet) => {
                let _ = self.events.send(Event::Inbound {
                    destination,
                    packet,
                });
            }
            Err(e) => warn!("dropping data message for {}: {}", destination, e),
        }
    }
}

impl Drop for StreamingRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Scan `dir` for `*.dat` destination files; unreadable files are skipped
fn load_local_destinations(
    dir: &Path,
    network: &NetworkContext,
    events: &mpsc::UnboundedSender<Event>,
    destinations: &mut HashMap<IdentHash, StreamingDestination>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read data dir {}: {}", dir.display(), e);
            return;
        }
    };

    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "dat") {
            continue;
        }
        match StreamingDestination::from_file(&path, network.clone(), events.clone()) {
            Ok(destination) => {
                debug!(
                    "loaded destination {} from {}",
                    destination.ident_hash(),
                    path.display()
                );
                destinations.insert(destination.ident_hash(), destination);
                count += 1;
            }
            Err(e) => warn!("skipping destination file {}: {}", path.display(), e),
        }
    }
    if count > 0 {
        info!("{} local destinations loaded", count);
    }
}

/// Loop-owned state; nothing outside the loop task touches it
struct DispatchState {
    destinations: HashMap<IdentHash, StreamingDestination>,
    shared: IdentHash,
}

impl DispatchState {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Inbound {
                destination,
                packet,
            } => match self.destinations.get_mut(&destination) {
                Some(dest) => dest.handle_next_packet(packet),
                None => warn!("local destination {} not found", destination),
            },
            Event::OpenStream { remote, reply } => {
                if let Some(dest) = self.destinations.get_mut(&self.shared) {
                    let _ = reply.send(dest.create_outgoing_stream(remote));
                }
            }
            Event::Send {
                destination,
                stream,
                data,
            } => {
                if let Some(dest) = self.destinations.get_mut(&destination) {
                    dest.send_on_stream(stream, &data);
                }
            }
            Event::Drain {
                destination,
                stream,
                max,
                reply,
            } => {
                let data = self
                    .destinations
                    .get_mut(&destination)
                    .map(|dest| dest.drain_stream(stream, max))
                    .unwrap_or_default();
                let _ = reply.send(data);
            }
            Event::Close {
                destination,
                stream,
            } => {
                if let Some(dest) = self.destinations.get_mut(&destination) {
                    dest.close_stream(stream);
                }
            }
            Event::Delete {
                destination,
                stream,
            } => {
                if let Some(dest) = self.destinations.get_mut(&destination) {
                    dest.delete_stream(stream);
                }
            }
            Event::SetAcceptor {
                destination,
                acceptor,
            } => match self.destinations.get_mut(&destination) {
                Some(dest) => dest.set_acceptor(acceptor),
                None => warn!("cannot set acceptor, destination {} not found", destination),
            },
        }
    }
}

async fn dispatch_loop(
    mut state: DispatchState,
    mut events: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => state.handle_event(event),
                None => break,
            },
            _ = cancel.cancelled() => {
                debug!("dispatch loop cancelled");
                break;
            }
        }
    }
}
