//! ISO-TP frame assembly (C4): single/first/consecutive-frame segmentation
//! for OBD-II responses on 0x7E8..0x7EE, with flow-control replies.
//!
//! Split out of the OBD-II client as its own reassembler, generalized from
//! teacher's `CanBus::obd_query` (which inlined this dispatch directly
//! against a `socketcan::CANSocket`) into something [`crate::obd2::ObdClient`]
//! drives per response id.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::can::{CanFrame, CanPort};
use crate::error::ObdError;

/// Lowest/highest OBD-II ECU response ids.
pub const RESPONSE_ID_RANGE: std::ops::RangeInclusive<u16> = 0x7E8..=0x7EE;

/// Flow-control frame sent back on `source_id - 8` after a first frame:
/// block size 0 (unlimited), STmin 0 (as fast as possible), per §4.4.
const FLOW_CONTROL: [u8; 8] = [0x30, 0x00, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55];

/// Per-source-id reassembly state.
struct Reassembly {
    total_len: usize,
    payload: Vec<u8>,
    next_seq: u8,
}

/// Accumulates ISO-TP frames from any number of OBD-II ECUs concurrently,
/// keyed by their response id, and emits flow control as needed.
///
/// One instance is shared by a single OBD-II query/response cycle; it does
/// not run its own thread, it is driven by [`crate::obd2::ObdClient`]'s
/// receive loop.
#[derive(Default)]
pub struct IsoTpReceiver {
    partial: HashMap<u16, Reassembly>,
}

impl IsoTpReceiver {
    /// Create an empty receiver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one CAN frame in. Returns `Some((source_id, payload))` once a
    /// message from that source completes; `frame` is ignored if its id is
    /// not in [`RESPONSE_ID_RANGE`].
    pub fn feed(
        &mut self,
        frame: &CanFrame,
        port: &dyn CanPort,
    ) -> Result<Option<(u16, Vec<u8>)>, ObdError> {
        if !RESPONSE_ID_RANGE.contains(&frame.id()) {
            return Ok(None);
        }
        let data = frame.data();
        if data.is_empty() {
            return Err(ObdError::IsoTp("empty ISO-TP frame".into()));
        }

        let frame_type = data[0] >> 4;
        match frame_type {
            0x0 => {
                // Single frame: low nibble is the payload length.
                if self.partial.remove(&frame.id()).is_some() {
                    debug!("discarding stale reassembly for 0x{:X}", frame.id());
                }
                let len = (data[0] & 0x0F) as usize;
                let payload = data.get(1..).unwrap_or(&[]);
                if len > payload.len() {
                    return Err(ObdError::IsoTp(format!(
                        "single frame declares {} bytes but carries {}",
                        len,
                        payload.len()
                    )));
                }
                Ok(Some((frame.id(), payload[..len].to_vec())))
            }
            0x1 => {
                // First frame: 12-bit total length across bytes 0/1.
                if data.len() < 2 {
                    return Err(ObdError::IsoTp("first frame too short".into()));
                }
                let total_len = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                let mut payload = Vec::with_capacity(total_len);
                payload.extend_from_slice(&data[2..]);

                self.partial.insert(
                    frame.id(),
                    Reassembly {
                        total_len,
                        payload,
                        next_seq: 1,
                    },
                );

                let flow = CanFrame::new(frame.id() - 8, FLOW_CONTROL.to_vec())
                    .map_err(|e| ObdError::IsoTp(e.to_string()))?;
                debug!("SEND {:02X}", flow);
                port.send(&flow)?;
                Ok(None)
            }
            0x2 => {
                // Consecutive frame: low nibble is the sequence number, 1..15 wrapping to 0.
                let reassembly = self
                    .partial
                    .get_mut(&frame.id())
                    .ok_or_else(|| ObdError::IsoTp("consecutive frame with no first frame".into()))?;

                let seq = data[0] & 0x0F;
                if seq != reassembly.next_seq {
                    return Err(ObdError::IsoTp(format!(
                        "out-of-sequence consecutive frame: expected {}, got {}",
                        reassembly.next_seq, seq
                    )));
                }
                reassembly.next_seq = (seq + 1) % 16;

                let remaining = reassembly.total_len - reassembly.payload.len();
                let take = remaining.min(data.len() - 1);
                reassembly.payload.extend_from_slice(&data[1..1 + take]);

                if reassembly.payload.len() >= reassembly.total_len {
                    let reassembly = self.partial.remove(&frame.id()).unwrap();
                    Ok(Some((frame.id(), reassembly.payload)))
                } else {
                    Ok(None)
                }
            }
            other => Err(ObdError::IsoTp(format!(
                "unexpected ISO-TP frame type nibble 0x{:X}",
                other
            ))),
        }
    }
}

/// How long [`crate::obd2::ObdClient`] waits on each response-id queue per
/// poll, per §4.5.
pub const PER_ECU_POLL: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::MockCanPort;

    #[test]
    fn assembles_single_frame() {
        let mut rx = IsoTpReceiver::new();
        let port = MockCanPort::endpoint();
        let frame = CanFrame::new(0x7E8, vec![0x02, 0x49, 0x00]).unwrap();
        let result = rx.feed(&frame, &port).unwrap();
        assert_eq!(result, Some((0x7E8, vec![0x49, 0x00])));
    }

    #[test]
    fn sends_flow_control_on_first_frame() {
        let mut rx = IsoTpReceiver::new();
        let a = MockCanPort::endpoint();
        let b = MockCanPort::endpoint();
        a.connect(&b);

        let first = CanFrame::new(0x7E8, vec![0x10, 0x14, 0x49, 0x02, 0x01, b'W', b'V', b'W']).unwrap();
        let result = rx.feed(&first, &a).unwrap();
        assert_eq!(result, None);

        let fc = b.recv(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(fc.id(), 0x7E0);
        assert_eq!(fc.data(), &FLOW_CONTROL);
    }

    #[test]
    fn reassembles_first_plus_consecutive_frames() {
        let mut rx = IsoTpReceiver::new();
        let port = MockCanPort::endpoint();

        let first = CanFrame::new(0x7E8, vec![0x10, 0x09, 1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(rx.feed(&first, &port).unwrap(), None);

        let consecutive = CanFrame::new(0x7E8, vec![0x21, 7, 8, 9]).unwrap();
        let result = rx.feed(&consecutive, &port).unwrap();
        assert_eq!(result, Some((0x7E8, vec![1, 2, 3, 4, 5, 6, 7, 8, 9])));
    }

    #[test]
    fn rejects_out_of_sequence_consecutive_frame() {
        let mut rx = IsoTpReceiver::new();
        let port = MockCanPort::endpoint();

        let first = CanFrame::new(0x7E8, vec![0x10, 0x09, 1, 2, 3, 4, 5, 6]).unwrap();
        rx.feed(&first, &port).unwrap();

        let bad = CanFrame::new(0x7E8, vec![0x22, 7, 8, 9]).unwrap();
        assert!(rx.feed(&bad, &port).is_err());
    }

    #[test]
    fn ignores_frames_outside_response_range() {
        let mut rx = IsoTpReceiver::new();
        let port = MockCanPort::endpoint();
        let frame = CanFrame::new(0x123, vec![0x02, 0x49, 0x00]).unwrap();
        assert_eq!(rx.feed(&frame, &port).unwrap(), None);
    }
}
