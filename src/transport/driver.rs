//! Per-session network loop
//!
//! Each negotiated session owns a UDP socket and a thread that moves
//! datagrams in and out of its [`Peer`], and hands queued media to it.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use str0m::net::{Protocol, Receive};
use str0m::Input;
use tracing::{info, warn};

use crate::model::packet::MediaPacket;
use crate::transport::peer::Peer;

/// Longest the loop sleeps on the socket, so queued media is not held back.
const MAX_WAIT: Duration = Duration::from_millis(5);

pub struct Driver {
    pub peer: Peer,
    pub socket: UdpSocket,
    pub media: Receiver<MediaPacket>,
    pub alive: Arc<AtomicBool>,
    pub connect_timeout: Duration,
}

impl Driver {
    pub fn run(mut self) {
        let local = match self.socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("UDP socket has no local address: {}", e);
                self.alive.store(false, Ordering::SeqCst);
                return;
            }
        };
        info!("Driving WebRTC session on {}", local);

        if let Err(e) = self.drive(local) {
            warn!("UDP socket failed: {}", e);
        }

        self.peer.disconnect();
        self.alive.store(false, Ordering::SeqCst);
        info!("WebRTC session on {} closed", local);
    }

    fn drive(&mut self, local: SocketAddr) -> io::Result<()> {
        let mut buf = vec![0; 2000];

        loop {
            if !self.peer.is_alive() {
                return Ok(());
            }

            if !self.peer.is_connected() && self.peer.started().elapsed() > self.connect_timeout {
                warn!("Viewer did not connect within {:?}", self.connect_timeout);
                return Ok(());
            }

            // Hand over media queued by the relay loop.
            loop {
                match self.media.try_recv() {
                    Ok(packet) => {
                        if self.peer.is_connected() {
                            self.peer.write_packet(&packet);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    // The relay loop is gone, and so is the session.
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            let timeout = self.peer.poll_until_timeout(&self.socket);

            // The read timeout is not allowed to be 0.
            let duration = timeout
                .saturating_duration_since(Instant::now())
                .clamp(Duration::from_millis(1), MAX_WAIT);
            self.socket.set_read_timeout(Some(duration))?;

            if let Some(input) = read_socket_input(&self.socket, local, &mut buf)? {
                if self.peer.accepts(&input) {
                    self.peer.handle_input(input);
                }
            }

            self.peer.handle_input(Input::Timeout(Instant::now()));
        }
    }
}

fn read_socket_input<'a>(
    socket: &UdpSocket,
    local: SocketAddr,
    buf: &'a mut Vec<u8>,
) -> io::Result<Option<Input<'a>>> {
    buf.resize(2000, 0);

    match socket.recv_from(buf) {
        Ok((n, source)) => {
            buf.truncate(n);

            // Not every datagram is something str0m can demultiplex.
            let Ok(contents) = buf.as_slice().try_into() else {
                return Ok(None);
            };

            Ok(Some(Input::Receive(
                Instant::now(),
                Receive {
                    proto: Protocol::Udp,
                    source,
                    destination: local,
                    contents,
                },
            )))
        }

        Err(e) => match e.kind() {
            // Expected error for set_read_timeout(). One for windows, one for the rest.
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Ok(None),
            _ => Err(e),
        },
    }
}
