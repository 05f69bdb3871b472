use crate::packet::{ErrorCode, ParseError, Packet, MAX_PACKET_SIZE};
use crate::session::{error_for_open_failure, ReadSession, WriteSession};
use log::*;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Interval the listener blocks for on each receive; bounds how long
/// `stop()` takes to become effective.
const LISTENER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default per-session receive timeout, matched against how long the
/// runner will wait before retransmitting.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Size of the listener's receive buffer. Larger than any packet this
/// server actually parses (`MAX_PACKET_SIZE`), matching against oversized
/// first datagrams without growing the allocation per-session.
const LISTENER_BUFFER_SIZE: usize = 1024;

#[derive(Debug)]
pub enum RunnerError {
    Io(io::Error),
    Parse(ParseError),
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunnerError::Io(e) => write!(f, "io error: {}", e),
            RunnerError::Parse(e) => write!(f, "parse error: {}", e),
        }
    }
}

impl std::error::Error for RunnerError {}

impl From<io::Error> for RunnerError {
    fn from(e: io::Error) -> Self {
        RunnerError::Io(e)
    }
}

impl From<ParseError> for RunnerError {
    fn from(e: ParseError) -> Self {
        RunnerError::Parse(e)
    }
}

pub type Result<T> = result::Result<T, RunnerError>;

/// Server configuration: the two protocol-level inputs (`port`, `root_dir`)
/// plus the ambient policy knobs a deployable binary needs.
#[derive(Clone, Debug)]
pub struct Config {
    /// UDP port to listen on.
    pub port: u16,
    /// Directory all RRQ/WRQ filenames are resolved under.
    pub root_dir: PathBuf,
    /// Reject all WRQ with `AccessViolation` before touching the filesystem.
    pub readonly: bool,
    /// Receive timeout used by each session runner.
    pub session_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 6969,
            root_dir: PathBuf::from("."),
            readonly: false,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// The TFTP server: a listener bound to the well-known port, plus the
/// `running` flag session runners never see but the listener polls between
/// receives.
pub struct Server {
    config: Config,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listener socket. Does not start serving; call `run`.
    pub fn bind(config: Config) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.port))?;
        socket.set_read_timeout(Some(LISTENER_POLL_INTERVAL))?;
        info!("tftp server listening on {}", socket.local_addr()?);
        Ok(Server {
            config,
            socket,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A clonable handle that can be used to call `stop()` from another
    /// thread while `run()` is blocking.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            running: self.running.clone(),
        }
    }

    /// Runs the listener loop until `stop()` is called. Never blocks on a
    /// session: each accepted RRQ/WRQ is handed to its own thread, which
    /// owns its socket and file handle exclusively from then on.
    pub fn run(&self) -> io::Result<()> {
        let mut buf = [0u8; LISTENER_BUFFER_SIZE];
        while self.running.load(Ordering::Acquire) {
            let (amt, src) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(e),
            };

            if let Err(e) = self.accept(&buf[..amt], src) {
                error!("failed to accept request from {}: {}", src, e);
            }
        }
        Ok(())
    }

    fn accept(&self, datagram: &[u8], src: SocketAddr) -> Result<()> {
        let packet = match Packet::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed datagram from {}: {}", src, e);
                return Ok(());
            }
        };

        let (filename, mode, is_write) = match packet {
            Packet::Request {
                filename,
                mode,
                is_write,
            } => (filename, mode, is_write),
            _ => {
                warn!("rejecting non-request packet as first datagram from {}", src);
                reply_once(ErrorCode::IllegalOperation.into(), src)?;
                return Ok(());
            }
        };
        // `mode` is accepted but not behaviorally distinguished: netascii
        // is treated identically to octet, mail is rejected below.
        if mode == crate::packet::Mode::Mail {
            info!("rejecting mail-mode request from {}", src);
            reply_once(ErrorCode::NoSuchUser.into(), src)?;
            return Ok(());
        }

        if is_write && self.config.readonly {
            info!("rejecting WRQ from {} (server is readonly)", src);
            reply_once(ErrorCode::AccessViolation.into(), src)?;
            return Ok(());
        }

        info!(
            "accepted {} request for {:?} from {}",
            if is_write { "WRQ" } else { "RRQ" },
            filename,
            src
        );

        let config = self.config.clone();
        thread::spawn(move || {
            let session_socket = match new_session_socket(&src, config.session_timeout) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to allocate session socket for {}: {}", src, e);
                    return;
                }
            };
            if is_write {
                run_write_session(session_socket, &config, &filename, src);
            } else {
                run_read_session(session_socket, &config, &filename, src);
            }
        });

        Ok(())
    }
}

/// Handle that flips `Server::run`'s `running` flag off. Cloned from
/// `Server::stopper()`; does not interrupt sessions already in flight.
#[derive(Clone)]
pub struct Stopper {
    running: Arc<AtomicBool>,
}

impl Stopper {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn new_session_socket(peer: &SocketAddr, timeout: Duration) -> io::Result<UdpSocket> {
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket)
}

/// Sends a single packet from a fresh one-shot socket, used to reply to
/// datagrams that never start a session (e.g. Illegal-Operation replies).
/// Keeps the listener socket itself reply-free: peers always see responses
/// coming from a per-exchange ephemeral port, as a real session would.
fn reply_once(packet: Packet, dst: SocketAddr) -> io::Result<()> {
    let socket = new_session_socket(&dst, Duration::from_millis(1))?;
    let bytes = packet.to_bytes();
    socket.send_to(&bytes, dst)?;
    Ok(())
}

fn send_packet(socket: &UdpSocket, packet: &Packet, dst: SocketAddr) -> io::Result<Vec<u8>> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let n = packet
        .serialize(&mut buf)
        .expect("MAX_PACKET_SIZE buffer is always large enough");
    socket.send_to(&buf[..n], dst)?;
    Ok(buf[..n].to_vec())
}

enum Recv {
    Packet(Packet),
    Timeout,
}

/// Receives one datagram, enforcing TID discipline: datagrams from any
/// address other than `peer` get an Unknown-Transfer-ID reply and are
/// otherwise ignored; the session's own state is untouched.
fn recv_from_peer(socket: &UdpSocket, peer: SocketAddr) -> io::Result<Recv> {
    loop {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (amt, src) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => return Ok(Recv::Timeout),
            Err(e) => return Err(e),
        };
        if src != peer {
            warn!(
                "dropping datagram from unexpected peer {} (expected {})",
                src, peer
            );
            let _ = send_packet(socket, &ErrorCode::UnknownTransferId.into(), src);
            continue;
        }
        match Packet::parse(&buf[..amt]) {
            Ok(p) => return Ok(Recv::Packet(p)),
            Err(e) => {
                warn!("dropping malformed datagram from {}: {}", src, e);
                continue;
            }
        }
    }
}

fn run_read_session(socket: UdpSocket, config: &Config, filename: &str, peer: SocketAddr) {
    let mut session = match ReadSession::open(&config.root_dir, filename) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot open {:?} for read ({}): {}", filename, peer, e);
            let reply = Packet::Error {
                code: error_for_open_failure(false),
                message: "File not found".to_owned(),
            };
            let _ = send_packet(&socket, &reply, peer);
            return;
        }
    };

    let mut last_sent = match send_next_block(&socket, &mut session, peer) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(e) => {
            error!("read session with {} failed: {}", peer, e);
            return;
        }
    };

    loop {
        match recv_from_peer(&socket, peer) {
            Ok(Recv::Timeout) => {
                warn!("timeout waiting for ack from {}, retransmitting", peer);
                if socket.send_to(&last_sent, peer).is_err() {
                    return;
                }
            }
            Ok(Recv::Packet(Packet::Ack(block_num))) => {
                if !session.handle_ack(block_num) {
                    continue;
                }
                if session.is_finished() {
                    info!("read session with {} complete", peer);
                    return;
                }
                match send_next_block(&socket, &mut session, peer) {
                    Ok(Some(bytes)) => last_sent = bytes,
                    Ok(None) => return,
                    Err(e) => {
                        error!("read session with {} failed: {}", peer, e);
                        return;
                    }
                }
            }
            Ok(Recv::Packet(Packet::Error { code, message })) => {
                error!("peer {} sent error {:?}: {}", peer, code, message);
                return;
            }
            Ok(Recv::Packet(_)) => continue, // ignore stray Data/Request replies
            Err(e) => {
                error!("socket error in read session with {}: {}", peer, e);
                return;
            }
        }
    }
}

fn send_next_block(
    socket: &UdpSocket,
    session: &mut ReadSession<std::fs::File>,
    peer: SocketAddr,
) -> io::Result<Option<Vec<u8>>> {
    match session.next_packet()? {
        None => Ok(None),
        Some((block_num, data)) => {
            let packet = Packet::Data {
                block_num,
                data: data.to_vec(),
            };
            let bytes = send_packet(socket, &packet, peer)?;
            Ok(Some(bytes))
        }
    }
}

fn run_write_session(socket: UdpSocket, config: &Config, filename: &str, peer: SocketAddr) {
    let mut session = match WriteSession::create(&config.root_dir, filename) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!("refusing to overwrite existing file {:?} for {}", filename, peer);
            let _ = send_packet(&socket, &ErrorCode::FileAlreadyExists.into(), peer);
            return;
        }
        Err(e) => {
            error!("cannot create {:?} for write ({}): {}", filename, peer, e);
            let reply = Packet::Error {
                code: error_for_open_failure(true),
                message: "Could not create file".to_owned(),
            };
            let _ = send_packet(&socket, &reply, peer);
            return;
        }
    };

    let mut last_ack = match send_packet(&socket, &Packet::Ack(0), peer) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("write session with {} failed to send initial ack: {}", peer, e);
            return;
        }
    };

    while !session.is_finished() {
        match recv_from_peer(&socket, peer) {
            Ok(Recv::Timeout) => {
                warn!("timeout waiting for data from {}, retransmitting ack", peer);
                if socket.send_to(&last_ack, peer).is_err() {
                    return;
                }
            }
            Ok(Recv::Packet(Packet::Data { block_num, data })) => {
                match session.handle_data(block_num, &data) {
                    Ok(Some(acked)) => match send_packet(&socket, &Packet::Ack(acked), peer) {
                        Ok(bytes) => last_ack = bytes,
                        Err(e) => {
                            error!("write session with {} failed to send ack: {}", peer, e);
                            return;
                        }
                    },
                    Ok(None) => continue,
                    Err(e) => {
                        error!("write session with {} failed to write: {}", peer, e);
                        return;
                    }
                }
            }
            Ok(Recv::Packet(Packet::Error { code, message })) => {
                error!("peer {} sent error {:?}: {}", peer, code, message);
                return;
            }
            Ok(Recv::Packet(_)) => continue, // ignore stray Ack/Request replies
            Err(e) => {
                error!("socket error in write session with {}: {}", peer, e);
                return;
            }
        }
    }
    info!("write session with {} complete", peer);
}
