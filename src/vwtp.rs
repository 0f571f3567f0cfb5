//! VWTP 2.0 transport: per-channel framing/ACK/keep-alive/reconnect (C2) and
//! channel allocation/connect handshake/RX demultiplex (C3).
//!
//! No teacher equivalent exists (the teacher only speaks KWP over K-line);
//! this module is ported from `original_source/vwtp.py`'s `VWTPConnection`/
//! `VWTPStack`, recast into Rust ownership per spec §9: the callback-style
//! receive becomes a bounded queue, `threading.Thread` pingers become
//! `std::thread::spawn` against a stop flag, and `queue.Empty`/exception
//! control flow becomes `Option`/`Result`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::can::{CanFrame, CanPort};
use crate::error::VwtpError;

/// CAN id for the initiator→peer setup request; peer module `n` answers on
/// `0x200 + n`.
pub const SETUP_REQUEST_ID: u16 = 0x200;
/// Start of the initiator RX id pool.
pub const RX_POOL_START: u16 = 0x300;
/// One past the end of the initiator RX id pool.
pub const RX_POOL_END: u16 = 0x310;

const OP_SETUP_REQUEST: u8 = 0xC0;
const OP_SETUP_RESPONSE: u8 = 0xD0;
const OP_DISCONNECT: u8 = 0xA8;
const OP_PING: u8 = 0xA3;
const OP_BREAK: u8 = 0xA4;
const OP_PARAMS_REQUEST: u8 = 0xA0;
const OP_PARAMS_RESPONSE: u8 = 0xA1;

/// Default parameter-negotiation request: block size 16 (encoded as 15),
/// ack timeout 100ms-scale count 10, inter-frame interval 0.1ms-scale count 10.
const PARAMS_REQUEST_BODY: [u8; 6] = [OP_PARAMS_REQUEST, 15, 0x8A, 0xFF, 0x0A, 0xFF];

const SETUP_RETRIES: u32 = 6;
const SETUP_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const ACK_RETRY_LIMIT: u32 = 10;
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Decode a "scaled byte" (upper 2 bits select a scale in {0.1, 1, 10, 100}
/// ms, lower 6 bits are the count), used for both `ack_timeout` and
/// `inter_frame_interval`. See testable property 4.
pub fn decode_scaled_duration(byte: u8) -> Duration {
    const SCALE_MS: [f64; 4] = [0.1, 1.0, 10.0, 100.0];
    let scale = SCALE_MS[(byte >> 6) as usize];
    let count = (byte & 0x3F) as f64;
    Duration::from_secs_f64(scale * count / 1000.0)
}

/// Negotiated channel parameters (C2 data model).
#[derive(Clone, Copy, Debug)]
pub struct ChannelParams {
    /// Number of data frames the peer will buffer before an ACK (1..16).
    pub block_size: u8,
    /// How long to wait for an ACK before a break-and-retransmit cycle.
    pub ack_timeout: Duration,
    /// Minimum spacing between consecutive frames.
    pub inter_frame_interval: Duration,
}

impl ChannelParams {
    fn decode(buf: &[u8]) -> Result<Self, VwtpError> {
        if buf.len() < 4 {
            return Err(VwtpError::Malformed("parameter response too short".into()));
        }
        Ok(Self {
            block_size: buf[0] + 1,
            ack_timeout: decode_scaled_duration(buf[1]),
            inter_frame_interval: decode_scaled_duration(buf[3]),
        })
    }
}

struct Reassembly {
    declared_len: usize,
    payload: Vec<u8>,
}

/// A single VWTP channel: one logical connection to one ECU module.
///
/// Exposes a connection-oriented byte-stream (`send`/`recv`) to the KWP
/// layer above it; internally runs a keep-alive thread while open.
pub struct VwtpChannel {
    module_id: u8,
    rx_id: u16,
    tx_id: Mutex<u16>,
    proto: u8,
    auto_reopen: bool,

    port: Arc<dyn CanPort>,
    stack: Weak<StackInner>,
    self_weak: Mutex<Weak<VwtpChannel>>,

    params: Mutex<Option<ChannelParams>>,
    rx_seq: Mutex<u8>,
    tx_seq: Mutex<u8>,

    pending_acks: Mutex<HashSet<u8>>,
    ack_cv: Condvar,

    reassembly: Mutex<Option<Reassembly>>,
    message_queue: Mutex<VecDeque<Vec<u8>>>,
    message_cv: Condvar,
    setup_queue: Mutex<VecDeque<Vec<u8>>>,
    setup_cv: Condvar,

    send_lock: Mutex<()>,
    sending: AtomicBool,
    open: AtomicBool,
    connected: AtomicBool,
    fault: Mutex<Option<VwtpError>>,

    keepalive_stop: Arc<AtomicBool>,
    keepalive_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VwtpChannel {
    fn new(
        module_id: u8,
        rx_id: u16,
        tx_id: u16,
        proto: u8,
        auto_reopen: bool,
        port: Arc<dyn CanPort>,
        stack: Weak<StackInner>,
    ) -> Self {
        Self {
            module_id,
            rx_id,
            tx_id: Mutex::new(tx_id),
            proto,
            auto_reopen,
            port,
            stack,
            self_weak: Mutex::new(Weak::new()),
            params: Mutex::new(None),
            rx_seq: Mutex::new(0),
            tx_seq: Mutex::new(0),
            pending_acks: Mutex::new(HashSet::new()),
            ack_cv: Condvar::new(),
            reassembly: Mutex::new(None),
            message_queue: Mutex::new(VecDeque::new()),
            message_cv: Condvar::new(),
            setup_queue: Mutex::new(VecDeque::new()),
            setup_cv: Condvar::new(),
            send_lock: Mutex::new(()),
            sending: AtomicBool::new(false),
            open: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            fault: Mutex::new(None),
            keepalive_stop: Arc::new(AtomicBool::new(false)),
            keepalive_handle: Mutex::new(None),
        }
    }

    /// The logical destination module id this channel talks to.
    pub fn module_id(&self) -> u8 {
        self.module_id
    }

    /// Our own RX id (fixed for the channel's lifetime).
    pub fn rx_id(&self) -> u16 {
        self.rx_id
    }

    /// Negotiated parameters, if channel setup has completed.
    pub fn params(&self) -> Option<ChannelParams> {
        *self.params.lock().unwrap()
    }

    fn tx_id(&self) -> u16 {
        *self.tx_id.lock().unwrap()
    }

    /// Perform the 0xA0/0xA1 parameter negotiation and start the keep-alive
    /// thread. Retries up to [`SETUP_RETRIES`] times at [`SETUP_RETRY_INTERVAL`].
    fn open(self_arc: &Arc<VwtpChannel>) -> Result<(), VwtpError> {
        self_arc.open.store(true, Ordering::SeqCst);
        for attempt in 0..SETUP_RETRIES {
            self_arc.send_raw(&PARAMS_REQUEST_BODY)?;
            if attempt > 0 {
                debug!("retransmitting VWTP parameter setup request");
            }
            if let Some(buf) = self_arc.pop_setup(SETUP_RETRY_INTERVAL) {
                let params = ChannelParams::decode(&buf)?;
                *self_arc.params.lock().unwrap() = Some(params);
                VwtpChannel::start_keepalive(self_arc);
                return Ok(());
            }
        }
        self_arc.open.store(false, Ordering::SeqCst);
        Err(VwtpError::SetupTimeout)
    }

    fn start_keepalive(self_arc: &Arc<VwtpChannel>) {
        let channel = self_arc.clone();
        let stop = self_arc.keepalive_stop.clone();
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(KEEPALIVE_INTERVAL);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if channel.open.load(Ordering::SeqCst) {
                    debug!("VWTP ping on channel 0x{:03X}", channel.rx_id);
                    if let Err(e) = channel.send_raw(&[OP_PING]) {
                        warn!("keep-alive ping failed: {}", e);
                    }
                }
            }
        });
        *self_arc.keepalive_handle.lock().unwrap() = Some(handle);
    }

    fn stop_keepalive(&self) {
        self.keepalive_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.keepalive_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn pop_setup(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut q = self.setup_queue.lock().unwrap();
        if q.is_empty() {
            let (g, _r) = self
                .setup_cv
                .wait_timeout_while(q, timeout, |q| q.is_empty())
                .unwrap();
            q = g;
        }
        q.pop_front()
    }

    /// Dispatch one received CAN payload (opcode byte + body) into this
    /// channel's state machine. Called from the stack's receive thread;
    /// never blocks on upper-layer logic beyond pushing into these queues.
    fn handle_frame(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let op = data[0];
        let buf = &data[1..];

        match op {
            OP_DISCONNECT => self.handle_disconnect(),
            OP_PING => {}
            OP_PARAMS_RESPONSE => {
                if self.params.lock().unwrap().is_some() {
                    debug!("ignoring duplicate parameter response (already configured)");
                    return;
                }
                self.setup_queue.lock().unwrap().push_back(buf.to_vec());
                self.setup_cv.notify_all();
            }
            op if op & 0xF0 == 0xB0 || op & 0xF0 == 0x90 => {
                if op & 0xF0 == 0x90 {
                    warn!("ACK with receiver-not-ready flag (0x9n); treating as ready");
                }
                let seq = op & 0x0F;
                self.pending_acks.lock().unwrap().insert(seq);
                self.ack_cv.notify_all();
            }
            _ => self.handle_data_frame(op, buf),
        }
    }

    fn handle_disconnect(&self) {
        if self.auto_reopen {
            self.connected.store(false, Ordering::SeqCst);
        }
        {
            let _guard = self.send_lock.lock().unwrap();
            if self.open.load(Ordering::SeqCst) {
                let _ = self.send_raw(&[OP_DISCONNECT]);
            }
            self.sending.store(false, Ordering::SeqCst);
        }
        *self.fault.lock().unwrap() = Some(VwtpError::PeerDisconnected);
        self.message_cv.notify_all();
        self.setup_cv.notify_all();
    }

    fn handle_data_frame(&self, op: u8, buf: &[u8]) {
        let seq = op & 0x0F;
        {
            let mut rx_seq = self.rx_seq.lock().unwrap();
            if op & 0x20 == 0 && seq == *rx_seq {
                let ack_seq = (seq + 1) % 16;
                if let Err(e) = self.send_ack(ack_seq) {
                    warn!("failed to send VWTP ACK: {}", e);
                }
            }
            *rx_seq = (*rx_seq + 1) % 16;
        }

        let mut reassembly = self.reassembly.lock().unwrap();
        match reassembly.as_mut() {
            None => {
                if buf.len() < 2 {
                    warn!("short VWTP frame fault, opcode 0x{:02X}", op);
                    return;
                }
                let declared_len = (((buf[0] as usize) << 8) | buf[1] as usize).max(buf.len() - 2);
                let mut payload = Vec::with_capacity(declared_len);
                payload.extend_from_slice(&buf[2..]);
                *reassembly = Some(Reassembly {
                    declared_len,
                    payload,
                });
            }
            Some(r) => r.payload.extend_from_slice(buf),
        }

        if op & 0x10 != 0 {
            let r = reassembly.take().unwrap();
            drop(reassembly);
            if self.proto == 1 && r.declared_len != r.payload.len() {
                warn!(
                    "VWTP frame length mismatch: expected {}, got {}",
                    r.declared_len,
                    r.payload.len()
                );
            }
            self.message_queue.lock().unwrap().push_back(r.payload);
            self.message_cv.notify_all();
        }
    }

    fn send_ack(&self, seq: u8) -> Result<(), VwtpError> {
        self.send_raw(&[0xB0 + seq])
    }

    fn send_raw(&self, data: &[u8]) -> Result<(), VwtpError> {
        if !self.open.load(Ordering::SeqCst) && data.first() != Some(&OP_DISCONNECT) {
            return Err(VwtpError::Closed);
        }
        let frame = CanFrame::new(self.tx_id(), data.to_vec())?;
        debug!("SEND {:02X}", frame);
        self.port.send(&frame)?;
        Ok(())
    }

    /// Send a complete VWTP-layer message, blocking until every block has
    /// been acknowledged (or retries are exhausted). Per §9, reconnect waits
    /// on [`Self::send_lock`] so it never interleaves with a half-sent block.
    pub fn send(&self, msg: &[u8]) -> Result<(), VwtpError> {
        if self.auto_reopen {
            // `connected` only ever drops for auto_reopen channels (see
            // handle_disconnect), so it's the right signal here.
            if !self.connected.load(Ordering::SeqCst) {
                self.reconnect()?;
            }
        } else if let Some(fault) = self.fault.lock().unwrap().as_ref() {
            // Non-reopening channels never flip `connected`; the fault is
            // the only record of a peer disconnect, so it must be checked
            // unconditionally rather than gated on `connected`.
            return Err(clone_fault(fault));
        }
        self.sending.store(true, Ordering::SeqCst);

        let mut framed = Vec::new();
        if self.proto == 1 {
            framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        }
        framed.extend_from_slice(msg);

        let chunks: Vec<&[u8]> = framed.chunks(7).collect();
        let block_size = self
            .params
            .lock()
            .unwrap()
            .map(|p| p.block_size as usize)
            .unwrap_or(1)
            .max(1);
        let total_blocks = chunks.chunks(block_size).count();

        for (block_index, block) in chunks.chunks(block_size).enumerate() {
            let is_last_block = block_index + 1 == total_blocks;
            let mut retries_left = ACK_RETRY_LIMIT;
            let mut acked = false;
            while !acked && self.sending.load(Ordering::SeqCst) {
                {
                    let _guard = self.send_lock.lock().unwrap();
                    acked = self.send_block(block, is_last_block)?;
                    if !acked {
                        let _ = self.send_raw(&[OP_BREAK]);
                    }
                }
                if !acked {
                    retries_left -= 1;
                    if retries_left == 0 {
                        self.sending.store(false, Ordering::SeqCst);
                        return Err(VwtpError::RetryExhausted);
                    }
                }
            }
            if !self.sending.load(Ordering::SeqCst) {
                return Err(VwtpError::Closed);
            }
        }
        self.sending.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Send one negotiated block of up to `block_size` 7-byte chunks. The
    /// last chunk of every block requests an ACK (sequence `tx_seq+1` at
    /// that point), giving real block-granularity flow control; the very
    /// last chunk of the whole message additionally carries the "final"
    /// flag. See DESIGN.md for why this departs from the upstream sender,
    /// whose per-block ACK branch is unreachable.
    fn send_block(&self, block: &[&[u8]], is_last_block: bool) -> Result<bool, VwtpError> {
        let mut seq = *self.tx_seq.lock().unwrap();
        let mut awaits_ack_at: Option<u8> = None;
        let last_index = block.len() - 1;

        for (i, chunk) in block.iter().enumerate() {
            let last_in_block = i == last_index;
            let final_frame = is_last_block && last_in_block;
            let mut op = seq;
            if !last_in_block {
                op |= 0x20;
            } else if final_frame {
                op |= 0x10;
            }
            if last_in_block {
                awaits_ack_at = Some((seq + 1) % 16);
            }
            let mut frame = vec![op];
            frame.extend_from_slice(chunk);
            self.send_raw(&frame)?;
            seq = (seq + 1) % 16;
        }
        *self.tx_seq.lock().unwrap() = seq;

        match awaits_ack_at {
            Some(expected) => self.await_ack(expected),
            None => Ok(true),
        }
    }

    fn await_ack(&self, seq: u8) -> Result<bool, VwtpError> {
        let timeout = self
            .params
            .lock()
            .unwrap()
            .map(|p| p.ack_timeout)
            .unwrap_or(Duration::from_millis(100));

        let mut acks = self.pending_acks.lock().unwrap();
        if !acks.contains(&seq) {
            let (g, _r) = self
                .ack_cv
                .wait_timeout_while(acks, timeout, |a| !a.contains(&seq))
                .unwrap();
            acks = g;
        }
        Ok(acks.remove(&seq))
    }

    /// Block for up to `timeout` for the next complete VWTP-layer message.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>, VwtpError> {
        if let Some(fault) = self.fault.lock().unwrap().as_ref() {
            return Err(clone_fault(fault));
        }
        let mut q = self.message_queue.lock().unwrap();
        if q.is_empty() {
            let (g, _r) = self
                .message_cv
                .wait_timeout_while(q, timeout, |q| q.is_empty())
                .unwrap();
            q = g;
        }
        Ok(q.pop_front())
    }

    fn reconnect(&self) -> Result<(), VwtpError> {
        let stack = self
            .stack
            .upgrade()
            .ok_or_else(|| VwtpError::ReconnectFailed("stack no longer exists".into()))?;
        let self_arc = self
            .self_weak
            .lock()
            .unwrap()
            .upgrade()
            .ok_or_else(|| VwtpError::ReconnectFailed("channel no longer exists".into()))?;

        let new_tx = stack.reconnect_channel(self.module_id, self.rx_id, self.proto)?;
        *self.tx_id.lock().unwrap() = new_tx;
        *self.fault.lock().unwrap() = None;
        VwtpChannel::open(&self_arc)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the channel: send a disconnect, stop the keep-alive thread,
    /// and mark the channel unusable. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.send_raw(&[OP_DISCONNECT]);
        }
        self.stop_keepalive();
    }
}

impl Drop for VwtpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn clone_fault(fault: &VwtpError) -> VwtpError {
    match fault {
        VwtpError::PeerDisconnected => VwtpError::PeerDisconnected,
        VwtpError::Closed => VwtpError::Closed,
        other => VwtpError::Malformed(other.to_string()),
    }
}

struct StackInner {
    port: Arc<dyn CanPort>,
    connections: Mutex<HashMap<u16, Arc<VwtpChannel>>>,
    setup_waiters: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
    next_rx: Mutex<u16>,
    dispatch_stop: Arc<AtomicBool>,
}

impl StackInner {
    fn allocate_rx(&self) -> Result<u16, VwtpError> {
        let mut next = self.next_rx.lock().unwrap();
        let connections = self.connections.lock().unwrap();
        let start = *next;
        loop {
            let candidate = *next;
            *next = if candidate == RX_POOL_END - 1 {
                RX_POOL_START
            } else {
                candidate + 1
            };
            if !connections.contains_key(&candidate) {
                return Ok(candidate);
            }
            if *next == start {
                return Err(VwtpError::ChannelsExhausted);
            }
        }
    }

    fn dispatch(&self, frame: &CanFrame) {
        let channel = self.connections.lock().unwrap().get(&frame.id()).cloned();
        if let Some(channel) = channel {
            debug!("RECV {:02X}", frame);
            channel.handle_frame(frame.data());
        } else if let Some(sender) = self.setup_waiters.lock().unwrap().get(&frame.id()) {
            debug!("RECV (setup) {:02X}", frame);
            let _ = sender.send(frame.data().to_vec());
        }
    }

    /// Perform the setup handshake for a fresh or reused `rx_id`, returning
    /// the peer-chosen tx id.
    fn setup_handshake(&self, dest: u8, rx_id: u16, proto: u8) -> Result<u16, VwtpError> {
        let control_id = SETUP_REQUEST_ID + dest as u16;
        let (tx, rx) = mpsc::channel();
        self.setup_waiters.lock().unwrap().insert(control_id, tx);

        let frame_data = vec![
            dest,
            OP_SETUP_REQUEST,
            0x00,
            0x10,
            (rx_id & 0xFF) as u8,
            (rx_id >> 8) as u8,
            proto,
        ];
        let frame = CanFrame::new(SETUP_REQUEST_ID, frame_data)?;

        let mut response = None;
        for _ in 0..SETUP_RETRIES {
            self.port.send(&frame)?;
            match rx.recv_timeout(SETUP_RETRY_INTERVAL) {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(_) => continue,
            }
        }
        self.setup_waiters.lock().unwrap().remove(&control_id);

        let response = response.ok_or(VwtpError::SetupTimeout)?;
        if response.first() != Some(&dest) {
            return Err(VwtpError::SetupRejected(format!(
                "response for different module: {:?}",
                response.first()
            )));
        }
        if response.get(1) != Some(&OP_SETUP_RESPONSE) {
            return Err(VwtpError::SetupRejected(format!(
                "negative or invalid connect response: {:?}",
                response.get(1)
            )));
        }
        if response.len() < 6 || response[5] & 0x10 != 0 {
            return Err(VwtpError::SetupRejected("invalid tx address".into()));
        }
        Ok(((response[5] as u16) << 8) | response[4] as u16)
    }

    fn reconnect_channel(&self, dest: u8, rx_id: u16, proto: u8) -> Result<u16, VwtpError> {
        self.setup_handshake(dest, rx_id, proto)
            .map_err(|e| VwtpError::ReconnectFailed(e.to_string()))
    }
}

/// Channel allocation, connect/disconnect handshake, and RX demultiplex for
/// every live VWTP channel sharing one CAN port (C3).
pub struct VwtpStack {
    inner: Arc<StackInner>,
    dispatch_handle: Option<thread::JoinHandle<()>>,
}

impl VwtpStack {
    /// Start a stack on `port`, spawning its receive-dispatch thread.
    pub fn new(port: Arc<dyn CanPort>) -> Self {
        let inner = Arc::new(StackInner {
            port,
            connections: Mutex::new(HashMap::new()),
            setup_waiters: Mutex::new(HashMap::new()),
            next_rx: Mutex::new(RX_POOL_START),
            dispatch_stop: Arc::new(AtomicBool::new(false)),
        });

        let dispatch_inner = inner.clone();
        let stop = inner.dispatch_stop.clone();
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match dispatch_inner.port.recv(Duration::from_millis(50)) {
                    Ok(Some(frame)) => dispatch_inner.dispatch(&frame),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("VWTP dispatch thread stopping: CAN recv error: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            inner,
            dispatch_handle: Some(handle),
        }
    }

    /// Allocate a channel from the RX pool and connect to `module_id`,
    /// performing the setup handshake and parameter negotiation.
    pub fn connect(&self, module_id: u8, proto: u8) -> Result<Arc<VwtpChannel>, VwtpError> {
        self.connect_with_reopen(module_id, proto, true)
    }

    /// As [`Self::connect`], controlling whether the channel auto-reopens
    /// after a peer-initiated disconnect.
    pub fn connect_with_reopen(
        &self,
        module_id: u8,
        proto: u8,
        auto_reopen: bool,
    ) -> Result<Arc<VwtpChannel>, VwtpError> {
        let rx_id = self.inner.allocate_rx()?;
        let tx_id = self.inner.setup_handshake(module_id, rx_id, proto)?;

        let channel = Arc::new(VwtpChannel::new(
            module_id,
            rx_id,
            tx_id,
            proto,
            auto_reopen,
            self.inner.port.clone(),
            Arc::downgrade(&self.inner),
        ));
        *channel.self_weak.lock().unwrap() = Arc::downgrade(&channel);
        self.inner
            .connections
            .lock()
            .unwrap()
            .insert(rx_id, channel.clone());

        VwtpChannel::open(&channel)?;
        Ok(channel)
    }

    /// Tear down a channel: send 0xA8, remove it from the dispatch table,
    /// and stop its keep-alive thread.
    pub fn disconnect(&self, channel: &Arc<VwtpChannel>) {
        channel.close();
        self.inner
            .connections
            .lock()
            .unwrap()
            .remove(&channel.rx_id);
    }
}

impl Drop for VwtpStack {
    fn drop(&mut self) {
        self.inner.dispatch_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatch_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::MockCanPort;

    #[test]
    fn scaled_duration_matches_testable_property_4() {
        // B = 0x32 -> scale[0] = 0.1ms, count 0x32 = 50 -> 5ms.
        assert_eq!(decode_scaled_duration(0x32), Duration::from_micros(5000));
    }

    #[test]
    fn setup_handshake_populates_block_size_and_timings() {
        let client = Arc::new(MockCanPort::endpoint());
        let ecu = MockCanPort::endpoint();
        client.connect(&ecu);

        let stack = VwtpStack::new(client as Arc<dyn CanPort>);

        let responder = thread::spawn(move || {
            let setup = ecu.recv(Duration::from_millis(500)).unwrap().unwrap();
            assert_eq!(setup.id(), SETUP_REQUEST_ID);
            assert_eq!(setup.data()[0], 0x01);

            let rx_id = ((setup.data()[5] as u16) << 8) | setup.data()[4] as u16;
            let response = CanFrame::new(
                SETUP_REQUEST_ID + 1,
                vec![0x01, 0xD0, 0x00, 0x03, 0x40, 0x07, 0x01],
            )
            .unwrap();
            ecu.send(&response).unwrap();

            let params_req = ecu.recv(Duration::from_millis(500)).unwrap().unwrap();
            assert_eq!(params_req.data()[0], OP_PARAMS_REQUEST);

            // Frames from the peer back to us arrive tagged with our own
            // rx id, the address we handed it in the setup request.
            let params_resp =
                CanFrame::new(rx_id, vec![0xA1, 0x0F, 0x8A, 0xFF, 0x32, 0xFF]).unwrap();
            ecu.send(&params_resp).unwrap();
        });

        let channel = stack.connect(0x01, 1).unwrap();
        responder.join().unwrap();

        let params = channel.params().unwrap();
        assert_eq!(params.block_size, 16);
        assert_eq!(params.inter_frame_interval, Duration::from_micros(5000));
    }
}
