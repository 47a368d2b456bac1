//! TCP listener that turns network connections into subscribers
//!
//! Each accepted connection gets a [`ChannelSubscriber`] registered with the
//! [`FanoutRegistry`], a writer thread that drains the subscriber's queue onto
//! the socket, and a reader thread that only watches for the peer closing the
//! connection. Whichever side fails first unsubscribes the connection; that
//! drops the queue's sender and the writer thread winds down.

use crate::error::{Result, ResultExt};
use crate::fanout::{ChannelSubscriber, FanoutRegistry, SubscriberId};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often blocked threads look at the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accepts subscriber connections until the running flag is cleared
pub struct SubscriberServer {
    listener: TcpListener,
    registry: Arc<FanoutRegistry>,
    running: Arc<AtomicBool>,
}

impl SubscriberServer {
    pub fn bind(
        address: impl ToSocketAddrs,
        registry: Arc<FanoutRegistry>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).context("Failed to bind subscriber listener")?;
        listener
            .set_nonblocking(true)
            .context("Failed to make subscriber listener non-blocking")?;
        Ok(Self {
            listener,
            registry,
            running,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop, then wait for every connection thread
    ///
    /// Returns the number of connections served.
    pub fn run(self) -> Result<usize> {
        let address = self.local_addr()?;
        tracing::info!("Subscriber server listening on {}", address);

        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        let mut served = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    served += 1;
                    match self.spawn_connection(stream, peer) {
                        Ok(handle) => connections.push(handle),
                        Err(e) => tracing::warn!("Failed to set up connection from {}: {}", peer, e),
                    }
                    connections.retain(|handle| !handle.is_finished());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }

        for handle in connections {
            let _ = handle.join();
        }
        tracing::info!("Subscriber server on {} stopped", address);
        Ok(served)
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<JoinHandle<()>> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let writer_stream = stream.try_clone()?;

        let (subscriber, queue) = ChannelSubscriber::pair(format!("tcp:{}", peer));
        let id = self.registry.subscribe(Arc::new(subscriber));

        let writer = {
            let registry = Arc::clone(&self.registry);
            let running = Arc::clone(&self.running);
            thread::Builder::new()
                .name(format!("subscriber-writer-{}", peer))
                .spawn(move || write_loop(writer_stream, queue, &registry, id, &running))?
        };

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name(format!("subscriber-reader-{}", peer))
            .spawn(move || {
                read_loop(&stream, &registry, id, &running);
                let _ = writer.join();
                let _ = stream.shutdown(Shutdown::Both);
                tracing::debug!("Connection {} from {} closed", id, peer);
            })?;
        Ok(handle)
    }
}

fn write_loop(
    mut stream: TcpStream,
    queue: Receiver<Vec<u8>>,
    registry: &FanoutRegistry,
    id: SubscriberId,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        match queue.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                if let Err(e) = stream.write_all(&line) {
                    tracing::debug!("Write to subscriber {} failed: {}", id, e);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            // Unsubscribed elsewhere
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    registry.unsubscribe(id);
    let _ = stream.shutdown(Shutdown::Both);
}

/// Discard anything the peer sends and return once it hangs up
fn read_loop(mut stream: &TcpStream, registry: &FanoutRegistry, id: SubscriberId, running: &AtomicBool) {
    let mut buf = [0u8; 256];
    while running.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    registry.unsubscribe(id);
}
