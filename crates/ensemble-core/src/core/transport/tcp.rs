use super::mailbox::{Inbound, Mailbox};
use super::{Envelope, Message, MessageKind, Outbox, Transport, TransportError};
use crate::core::models::ids::{COORDINATOR_RANK, Rank};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL: Duration = Duration::from_millis(20);
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// One line on the wire.
#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello { rank: Rank },
    Payload(Message),
}

struct Peer {
    writer: Mutex<BufWriter<TcpStream>>,
    socket: TcpStream,
}

struct Peers {
    rank: Rank,
    size: usize,
    /// Indexed by rank; `None` where this rank has no direct connection.
    links: Vec<Option<Peer>>,
}

impl Peers {
    fn write(&self, dest: Rank, frame: &Frame) -> Result<(), TransportError> {
        let peer = self
            .links
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or(TransportError::UnknownRank {
                rank: dest,
                from: self.rank,
                size: self.size,
            })?;
        let mut writer = peer.writer.lock().unwrap_or_else(|p| p.into_inner());
        write_frame(&mut *writer, frame)
    }

    fn shutdown(&self) {
        for peer in self.links.iter().flatten() {
            let _ = peer.socket.shutdown(Shutdown::Both);
        }
    }
}

impl Outbox for Peers {
    fn post(&self, dest: Rank, message: Message) -> Result<(), TransportError> {
        self.write(dest, &Frame::Payload(message))
    }
}

fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), TransportError> {
    serde_json::to_writer(&mut *writer, frame)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn read_frame<R: BufRead>(reader: &mut R) -> Result<Option<Frame>, TransportError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

/// Feeds every payload frame from `peer` into the mailbox until the connection closes, then
/// posts the closure.
fn spawn_reader(
    peer: Rank,
    mut reader: BufReader<TcpStream>,
    inbound: Sender<Inbound>,
    aborted: Arc<AtomicBool>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("cadee-rx-{peer}"))
        .spawn(move || {
            loop {
                match read_frame(&mut reader) {
                    Ok(Some(Frame::Payload(message))) => {
                        if inbound
                            .send(Inbound::Message(Envelope::new(peer, message)))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Some(Frame::Hello { rank })) => {
                        warn!("Ignoring repeated hello (rank {}) on link to rank {}", rank, peer);
                    }
                    Ok(None) => {
                        debug!("Rank {} closed its connection", peer);
                        break;
                    }
                    Err(e) => {
                        if !aborted.load(Ordering::SeqCst) {
                            error!("Link to rank {} failed: {}", peer, e);
                        }
                        break;
                    }
                }
            }
            let _ = inbound.send(Inbound::Closed(peer));
        })
        .map(|_| ())
}

/// A transport where every rank is its own OS process, connected in a star around rank 0.
pub struct TcpTransport {
    peers: Arc<Peers>,
    mailbox: Mailbox,
    aborted: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Coordinator side: accepts exactly `workers` connections on `listener`, each of which must
    /// introduce itself with a distinct rank in `1..=workers`.
    pub fn serve(
        listener: TcpListener,
        workers: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let size = workers + 1;
        let deadline = Instant::now() + timeout;
        let aborted = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let mut links: Vec<Option<Peer>> = (0..size).map(|_| None).collect();
        let mut connected = 0;

        listener.set_nonblocking(true)?;
        info!(
            "Waiting for {} worker(s) on {}",
            workers,
            listener.local_addr()?
        );

        while connected < workers {
            let (stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Handshake(format!(
                            "only {connected} of {workers} workers connected before the deadline"
                        )));
                    }
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match Self::admit(stream, addr, size, &links) {
                Ok((rank, peer, reader)) => {
                    spawn_reader(rank, reader, tx.clone(), aborted.clone())?;
                    links[rank] = Some(peer);
                    connected += 1;
                    debug!("Rank {} connected from {} ({}/{})", rank, addr, connected, workers);
                }
                Err(e) => warn!("Rejected connection from {}: {}", addr, e),
            }
        }

        Ok(Self {
            peers: Arc::new(Peers {
                rank: COORDINATOR_RANK,
                size,
                links,
            }),
            mailbox: Mailbox::new(COORDINATOR_RANK, rx, aborted.clone()),
            aborted,
        })
    }

    fn admit(
        stream: TcpStream,
        addr: SocketAddr,
        size: usize,
        links: &[Option<Peer>],
    ) -> Result<(Rank, Peer, BufReader<TcpStream>), TransportError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let rank = match read_frame(&mut reader)? {
            Some(Frame::Hello { rank }) => rank,
            Some(Frame::Payload(_)) => {
                return Err(TransportError::Handshake(format!(
                    "{addr} sent a payload before introducing itself"
                )));
            }
            None => {
                return Err(TransportError::Handshake(format!(
                    "{addr} closed before introducing itself"
                )));
            }
        };

        if rank == COORDINATOR_RANK || rank >= size {
            return Err(TransportError::Handshake(format!(
                "rank {rank} is outside 1..{size}"
            )));
        }
        if links[rank].is_some() {
            return Err(TransportError::Handshake(format!(
                "rank {rank} is already connected"
            )));
        }

        stream.set_read_timeout(None)?;
        let peer = Peer {
            writer: Mutex::new(BufWriter::new(stream.try_clone()?)),
            socket: stream,
        };
        Ok((rank, peer, reader))
    }

    /// Worker side: connects to the coordinator, retrying until `patience` runs out.
    pub fn connect(
        addr: impl ToSocketAddrs,
        rank: Rank,
        size: usize,
        patience: Duration,
    ) -> Result<Self, TransportError> {
        if rank == COORDINATOR_RANK || rank >= size {
            return Err(TransportError::Handshake(format!(
                "worker rank {rank} is outside 1..{size}"
            )));
        }

        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        let deadline = Instant::now() + patience;
        let stream = loop {
            match TcpStream::connect(&addrs[..]) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!("Coordinator not reachable yet ({}), retrying", e);
                    thread::sleep(CONNECT_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nodelay(true)?;

        let mut writer = BufWriter::new(stream.try_clone()?);
        write_frame(&mut writer, &Frame::Hello { rank })?;

        let aborted = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        spawn_reader(
            COORDINATOR_RANK,
            BufReader::new(stream.try_clone()?),
            tx,
            aborted.clone(),
        )?;

        let mut links: Vec<Option<Peer>> = (0..size).map(|_| None).collect();
        links[COORDINATOR_RANK] = Some(Peer {
            writer: Mutex::new(writer),
            socket: stream,
        });

        Ok(Self {
            peers: Arc::new(Peers { rank, size, links }),
            mailbox: Mailbox::new(rank, rx, aborted.clone()),
            aborted,
        })
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.peers.rank
    }

    fn size(&self) -> usize {
        self.peers.size
    }

    fn send(&self, dest: Rank, message: Message) -> Result<(), TransportError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(TransportError::Aborted);
        }
        self.peers.post(dest, message)
    }

    fn recv(&mut self, source: Rank, kind: MessageKind) -> Result<Message, TransportError> {
        match self.mailbox.take(Some(source), Some(kind), None)? {
            Some(env) => Ok(env.message),
            None => Err(TransportError::Disconnected {
                rank: self.peers.rank,
            }),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>, TransportError> {
        self.mailbox.take(None, None, Some(timeout))
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        self.peers.clone()
    }

    fn abort(&self, code: i32) {
        error!(code, "Aborting fleet from rank {}", self.peers.rank);
        self.aborted.store(true, Ordering::SeqCst);
        self.peers.shutdown();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.peers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::unit::{Assignment, WorkUnit};

    fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn coordinator_and_workers_exchange_messages() {
        let (listener, addr) = listener();

        let worker = thread::spawn(move || {
            let mut t = TcpTransport::connect(addr, 1, 2, Duration::from_secs(5)).unwrap();
            t.send(0, Message::Done { previous: None }).unwrap();
            let reply = t.recv(0, MessageKind::Inputs).unwrap();
            t.send(0, Message::Shutdown).unwrap();
            reply
        });

        let mut coordinator = TcpTransport::serve(listener, 1, Duration::from_secs(5)).unwrap();
        let first = coordinator.poll(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(first.source, 1);
        assert_eq!(first.message, Message::Done { previous: None });

        let assignment = Assignment::Unit(WorkUnit::new("/packs/wt_0.tar"));
        coordinator
            .send(1, Message::Inputs(assignment.clone()))
            .unwrap();
        assert_eq!(coordinator.recv(1, MessageKind::Shutdown).unwrap(), Message::Shutdown);

        assert_eq!(worker.join().unwrap(), Message::Inputs(assignment));
    }

    #[test]
    fn duplicate_rank_is_rejected_and_accept_continues() {
        let (listener, addr) = listener();

        let clients = thread::spawn(move || {
            let first = TcpTransport::connect(addr, 1, 3, Duration::from_secs(5)).unwrap();
            let _dup = TcpTransport::connect(addr, 1, 3, Duration::from_secs(5)).unwrap();
            let second = TcpTransport::connect(addr, 2, 3, Duration::from_secs(5)).unwrap();
            first.send(0, Message::IoRequest).unwrap();
            second.send(0, Message::IoRequest).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let mut coordinator = TcpTransport::serve(listener, 2, Duration::from_secs(5)).unwrap();
        let mut sources = vec![
            coordinator.recv(1, MessageKind::IoRequest).map(|_| 1).unwrap(),
            coordinator.recv(2, MessageKind::IoRequest).map(|_| 2).unwrap(),
        ];
        sources.sort();
        assert_eq!(sources, vec![1, 2]);
        clients.join().unwrap();
    }

    #[test]
    fn serve_times_out_when_workers_never_arrive() {
        let (listener, _) = listener();
        let result = TcpTransport::serve(listener, 1, Duration::from_millis(100));
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[test]
    fn connect_rejects_coordinator_rank() {
        let (_listener, addr) = listener();
        let result = TcpTransport::connect(addr, 0, 2, Duration::from_millis(10));
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[test]
    fn dropped_worker_is_reported_to_the_coordinator() {
        let (listener, addr) = listener();

        let workers = thread::spawn(move || {
            let quitter = TcpTransport::connect(addr, 1, 3, Duration::from_secs(5)).unwrap();
            let polite = TcpTransport::connect(addr, 2, 3, Duration::from_secs(5)).unwrap();
            polite.send(0, Message::Shutdown).unwrap();
            drop(polite);
            drop(quitter);
        });

        let mut coordinator = TcpTransport::serve(listener, 2, Duration::from_secs(5)).unwrap();
        workers.join().unwrap();

        let mut lost = Vec::new();
        let mut acked = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while lost.len() < 2 && Instant::now() < deadline {
            match coordinator.poll(Duration::from_millis(50)) {
                Ok(Some(env)) => {
                    assert_eq!((env.source, env.message), (2, Message::Shutdown));
                    assert!(!lost.contains(&2), "rank 2 acked after its link closed");
                    acked = true;
                }
                Ok(None) => {}
                Err(TransportError::PeerLost { rank }) => lost.push(rank),
                Err(TransportError::Disconnected { .. }) => break,
                Err(e) => panic!("unexpected transport error: {e}"),
            }
        }
        lost.sort_unstable();
        assert!(acked);
        assert_eq!(lost, vec![1, 2]);
    }
}
