//! CAN frame port (C1): the abstract send/receive boundary every other layer
//! is built on, plus a SocketCAN-backed implementation and an in-memory one
//! for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::CanError;
use crate::misc::run_cmd_as_root;

/// Highest permitted 11-bit standard CAN identifier.
pub const MAX_STD_ID: u16 = 0x7FF;
/// Highest permitted CAN data length.
pub const MAX_DATA_LEN: usize = 8;

/// An 11-bit standard CAN frame.
///
/// Only standard (non-extended) identifiers are modeled; this stack never
/// needs 29-bit IDs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    id: u16,
    data: Vec<u8>,
}

impl CanFrame {
    /// Construct a frame, rejecting out-of-range identifiers or oversized
    /// payloads rather than silently truncating them.
    pub fn new(id: u16, data: impl Into<Vec<u8>>) -> Result<Self, CanError> {
        let data = data.into();
        if id > MAX_STD_ID {
            return Err(CanError::Malformed(format!(
                "identifier 0x{:X} exceeds 11-bit range",
                id
            )));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(CanError::Malformed(format!(
                "{} data bytes exceeds the 8-byte CAN payload limit",
                data.len()
            )));
        }
        Ok(Self { id, data })
    }

    /// The 11-bit arbitration id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The frame's data bytes (0..=8 of them).
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::UpperHex for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03X}#{:02X?}", self.id, self.data)
    }
}

/// A thread-safe, possibly-blocking source/sink of full CAN frames.
///
/// Implementations may wrap a real interface (SocketCAN) or an in-memory
/// queue. Every higher layer is written against this trait, never against a
/// concrete transport.
pub trait CanPort: Send + Sync {
    /// Send one frame. Fatal on failure; the core never retries sends that
    /// the OS/driver itself reports as failed.
    fn send(&self, frame: &CanFrame) -> Result<(), CanError>;

    /// Block for up to `timeout` waiting for the next frame. Returns `Ok(None)`
    /// on a clean timeout, `Err` on a port failure.
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, CanError>;
}

/// CAN port backed by a real SocketCAN interface.
pub struct SocketCanPort {
    socket: socketcan::CANSocket,
    iface: String,
}

impl SocketCanPort {
    /// Bring up the named CAN interface at the given bit rate (defaulting to
    /// 500 kbit/s) via `ip link`, and open a socket on it.
    ///
    /// The interface is expected not to already exist; [`Drop`] brings it
    /// back down on teardown.
    pub fn init(iface: &str, bit_rate: Option<u64>) -> Result<Self, CanError> {
        run_cmd_as_root(format!(
            "ip link set {} up type can bitrate {}",
            iface,
            bit_rate.unwrap_or(500_000)
        ))
        .map_err(|e| CanError::Send(e.to_string()))?;

        let socket =
            socketcan::CANSocket::open(iface).map_err(|e| CanError::Recv(e.to_string()))?;
        socket
            .set_read_timeout(Duration::from_millis(500))
            .map_err(|e| CanError::Recv(e.to_string()))?;
        socket
            .set_write_timeout(Duration::from_millis(500))
            .map_err(|e| CanError::Send(e.to_string()))?;

        Ok(Self {
            socket,
            iface: iface.to_string(),
        })
    }
}

impl Drop for SocketCanPort {
    fn drop(&mut self) {
        if let Err(e) = run_cmd_as_root(format!("ip link set {} down", self.iface)) {
            warn!("Failed to shut down CAN interface: {}", e);
        }
    }
}

impl CanPort for SocketCanPort {
    fn send(&self, frame: &CanFrame) -> Result<(), CanError> {
        let can_frame = socketcan::CANFrame::new(frame.id() as u32, frame.data(), false, false)
            .map_err(|e| CanError::Malformed(e.to_string()))?;
        debug!("SEND {:02X}", frame);
        self.socket
            .write_frame_insist(&can_frame)
            .map_err(|e| CanError::Send(e.to_string()))
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, CanError> {
        // socketcan's read timeout is fixed at socket-open time (500ms); poll
        // in that granularity until our caller's deadline passes.
        let deadline = Instant::now() + timeout;
        loop {
            match self.socket.read_frame() {
                Ok(f) => {
                    let frame = CanFrame::new(f.id() as u16, f.data().to_vec())?;
                    debug!("RECV {:02X}", frame);
                    return Ok(Some(frame));
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    if e.kind() != std::io::ErrorKind::WouldBlock
                        && e.kind() != std::io::ErrorKind::TimedOut
                    {
                        return Err(CanError::Recv(e.to_string()));
                    }
                }
            }
        }
    }
}

type Inbox = Arc<(Mutex<VecDeque<CanFrame>>, Condvar)>;

/// In-memory CAN bus endpoint for tests: every frame sent from one endpoint
/// is delivered to every endpoint it's [`connect`](MockCanPort::connect)ed
/// to, mirroring how a real CAN bus broadcasts to all nodes.
pub struct MockCanPort {
    inbox: Inbox,
    peers: Mutex<Vec<Inbox>>,
    closed: Arc<AtomicBool>,
}

impl MockCanPort {
    /// Create a standalone endpoint with no peers yet.
    pub fn endpoint() -> Self {
        Self {
            inbox: Arc::new((Mutex::new(VecDeque::new()), Condvar::new())),
            peers: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire `self` and `other` together so frames sent on either are
    /// observed by the other. Call pairwise for more than two endpoints.
    pub fn connect(&self, other: &MockCanPort) {
        self.peers.lock().unwrap().push(other.inbox.clone());
        other.peers.lock().unwrap().push(self.inbox.clone());
    }

    /// Directly inject a frame into this endpoint's inbox, as if received
    /// from the bus, without it having been sent by a connected peer.
    pub fn inject(&self, frame: CanFrame) {
        let (lock, cvar) = &*self.inbox;
        lock.lock().unwrap().push_back(frame);
        cvar.notify_all();
    }
}

impl CanPort for MockCanPort {
    fn send(&self, frame: &CanFrame) -> Result<(), CanError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CanError::Send("mock bus closed".into()));
        }
        for peer in self.peers.lock().unwrap().iter() {
            let (lock, cvar) = &**peer;
            lock.lock().unwrap().push_back(frame.clone());
            cvar.notify_all();
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, CanError> {
        let (lock, cvar) = &*self.inbox;
        let mut queue = lock.lock().unwrap();
        if queue.is_empty() {
            let (q, result) = cvar
                .wait_timeout_while(queue, timeout, |q| q.is_empty())
                .unwrap();
            queue = q;
            if result.timed_out() && queue.is_empty() {
                return Ok(None);
            }
        }
        Ok(queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_payload() {
        assert!(CanFrame::new(0x700, vec![0u8; 9]).is_err());
    }

    #[test]
    fn rejects_extended_id() {
        assert!(CanFrame::new(0x800, vec![0u8]).is_err());
    }

    #[test]
    fn mock_port_delivers_between_peers() {
        let a = MockCanPort::endpoint();
        let b = MockCanPort::endpoint();
        a.connect(&b);

        let frame = CanFrame::new(0x123, vec![1, 2, 3]).unwrap();
        a.send(&frame).unwrap();

        let got = b.recv(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(got, frame);
    }

    #[test]
    fn mock_port_recv_times_out_cleanly() {
        let a = MockCanPort::endpoint();
        let got = a.recv(Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
    }
}
