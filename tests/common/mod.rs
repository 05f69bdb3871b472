use std::net::UdpSocket;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tftp_server::{Config, Server, Stopper};

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn client_socket() -> UdpSocket {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("cannot bind client socket");
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    socket
}

pub struct RunningServer {
    pub addr: std::net::SocketAddr,
    stopper: Stopper,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl RunningServer {
    pub fn start(root_dir: PathBuf) -> Self {
        Self::start_with(Config {
            port: 0,
            root_dir,
            readonly: false,
            session_timeout: Duration::from_millis(500),
        })
    }

    pub fn start_with(config: Config) -> Self {
        let server = Server::bind(config).expect("cannot bind test server");
        let addr = server.local_addr().unwrap();
        let stopper = server.stopper();
        let handle = thread::spawn(move || server.run());
        RunningServer {
            addr,
            stopper,
            handle: Some(handle),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stopper.stop();
        // The listener only notices `stop()` on its next 100ms poll tick or
        // the next datagram, whichever comes first; nudge it along.
        if let Ok(s) = UdpSocket::bind(("127.0.0.1", 0)) {
            let _ = s.send_to(&[0, 9], self.addr);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
