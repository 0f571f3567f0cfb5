//! OBD-II client (C5): service/PID queries, multi-ECU PID-support discovery,
//! VIN read, and DTC read/clear/freeze-frame, built on the ISO-TP reassembler.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::debug;

use crate::can::{CanFrame, CanPort};
use crate::dtc::{Diagnose, DiagnosticTroubleCode};
use crate::error::{Error, ObdError};
use crate::isotp::{IsoTpReceiver, PER_ECU_POLL, RESPONSE_ID_RANGE};

/// Broadcast request id for OBD-II queries.
pub const BROADCAST_ID: u16 = 0x7DF;
/// Overall timeout for a single `obd_query` round-trip.
const QUERY_TIMEOUT: Duration = Duration::from_millis(2000);
/// Byte used to pad short OBD-II request frames out to 8 bytes.
const PAD_BYTE: u8 = 0x99;

/// Abstraction over "send one OBD-II request, collect the single-ECU
/// response" for whatever transport a caller is using (plain CAN here; KWP
/// traffic never goes through this trait).
pub trait Obd2Protocol {
    /// Send `service`/`args` to the broadcast address and return the first
    /// ECU's response payload, with the service-response id and echoed
    /// PID/args stripped.
    fn obd_query(&mut self, service: u8, args: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A single OBD-II ECU discovered on the bus, with the set of PIDs it has
/// reported support for.
#[derive(Debug, Default)]
struct EcuRecord {
    supported_pids: HashSet<u8>,
}

/// OBD-II client over a [`CanPort`], with per-ECU PID-support tracking.
pub struct ObdClient<P: CanPort> {
    port: P,
    ecus: HashMap<u16, EcuRecord>,
}

impl<P: CanPort> ObdClient<P> {
    /// Build a client and discover ECUs by walking the service 1 PID-support
    /// bitmasks starting at PID 0, per §4.5.
    pub fn new(port: P) -> Result<Self, Error> {
        let mut client = Self::without_discovery(port);
        client.discover_pids(0x00)?;
        Ok(client)
    }

    /// Build a client without performing PID-support discovery, for callers
    /// (and tests) that only need [`Self::read_vin`]/[`Self::query`] and
    /// would rather not pay for (or block on) the discovery round-trip.
    pub fn without_discovery(port: P) -> Self {
        Self {
            port,
            ecus: HashMap::new(),
        }
    }

    /// Query the PID-support bitmask at `base` (0x00, 0x20, 0x40, 0x60, ...)
    /// for every ECU, recording which PIDs in that window are supported and
    /// recursing into the next window if its top bit is set.
    fn discover_pids(&mut self, base: u8) -> Result<(), Error> {
        let responses = self.read_pid(0x01, base, BROADCAST_ID)?;
        for (ecu_id, payload) in responses {
            if payload.len() < 4 {
                continue;
            }
            let mask = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let record = self.ecus.entry(ecu_id).or_default();

            for bit in 0..32u32 {
                // bit 31 (highest) is PID base+1, bit 0 is PID base+32.
                if mask & (1 << (31 - bit)) != 0 {
                    record.supported_pids.insert(base.wrapping_add(bit as u8 + 1));
                }
            }

            if mask & 0x1 != 0 && base.checked_add(0x20).is_some() {
                self.discover_pids(base + 0x20)?;
            }
        }
        Ok(())
    }

    /// Send one 8-byte request, padded with [`PAD_BYTE`], to `ecu`.
    fn send(&self, ecu: u16, service: u8, args: &[u8]) -> Result<(), Error> {
        let mut data = vec![1 + args.len() as u8, service];
        data.extend_from_slice(args);
        data.resize(8, PAD_BYTE);

        let frame = CanFrame::new(ecu, data).map_err(ObdError::from)?;
        debug!("SEND {:02X}", frame);
        self.port.send(&frame).map_err(ObdError::from)?;
        Ok(())
    }

    /// Send `service`/`args` once, then drain each response-id queue with a
    /// short per-queue timeout, returning whichever ECUs answered (header
    /// stripped down to the service-response byte and echoed `args`).
    ///
    /// Per §4.5: a ~100ms poll per response id, not a single blocking read,
    /// since multiple ECUs may each have their own in-flight reassembly.
    pub fn query(
        &mut self,
        service: u8,
        args: &[u8],
        ecu: u16,
    ) -> Result<HashMap<u16, Vec<u8>>, Error> {
        self.send(ecu, service, args)?;

        let mut receiver = IsoTpReceiver::new();
        let mut results = HashMap::new();
        let deadline = Instant::now() + QUERY_TIMEOUT;
        let header_len = 1 + args.len();

        for response_id in RESPONSE_ID_RANGE {
            if results.contains_key(&response_id) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = PER_ECU_POLL.min(remaining);
            if poll.is_zero() {
                break;
            }

            let poll_deadline = Instant::now() + poll;
            while Instant::now() < poll_deadline {
                let frame = match self.port.recv(poll_deadline - Instant::now()) {
                    Ok(Some(f)) => f,
                    Ok(None) => break,
                    Err(e) => return Err(ObdError::from(e).into()),
                };
                debug!("RECV {:02X}", frame);
                if let Some((source, payload)) = receiver.feed(&frame, &self.port)? {
                    let expected_response = service + 0x40;
                    if payload.first() != Some(&expected_response) {
                        return Err(ObdError::Mismatch(format!(
                            "expected response service 0x{:02X}, got {:?}",
                            expected_response,
                            payload.first()
                        ))
                        .into());
                    }
                    let tail = payload.get(header_len..).unwrap_or(&[]);
                    results.insert(source, tail.to_vec());
                }
            }
        }

        Ok(results)
    }

    /// [`ObdClient::query`] for a single-PID request.
    pub fn read_pid(
        &mut self,
        service: u8,
        pid: u8,
        ecu: u16,
    ) -> Result<HashMap<u16, Vec<u8>>, Error> {
        self.query(service, &[pid], ecu)
    }

    /// Read the vehicle's VIN via service 9 PID 2, per §4.5.
    pub fn read_vin(&mut self) -> Result<String, Error> {
        let responses = self.read_pid(0x09, 0x02, BROADCAST_ID)?;
        let payload = responses
            .values()
            .next()
            .ok_or_else(|| ObdError::Timeout)?;

        // Already stripped of [service, pid]; one byte "frame count" remains
        // before the ASCII VIN.
        if payload.is_empty() {
            return Err(ObdError::Mismatch("empty VIN response".into()).into());
        }
        let vin_bytes = &payload[1..];
        String::from_utf8(vin_bytes.to_vec())
            .map_err(|e| ObdError::Mismatch(e.to_string()).into())
    }

    /// ECU ids discovered during PID-support scanning.
    pub fn known_ecus(&self) -> impl Iterator<Item = &u16> {
        self.ecus.keys()
    }

    /// Whether `ecu` reported support for `pid` during PID-support scanning.
    pub fn supports_pid(&self, ecu: u16, pid: u8) -> bool {
        self.ecus
            .get(&ecu)
            .map(|record| record.supported_pids.contains(&pid))
            .unwrap_or(false)
    }
}

impl<P: CanPort> Obd2Protocol for ObdClient<P> {
    fn obd_query(&mut self, service: u8, args: &[u8]) -> Result<Vec<u8>, Error> {
        let responses = self.query(service, args, BROADCAST_ID)?;
        responses
            .into_values()
            .next()
            .ok_or_else(|| ObdError::Timeout.into())
    }
}

impl<T: Obd2Protocol> Diagnose for T {
    fn read_dtcs(&mut self, pending: bool) -> Result<Vec<DiagnosticTroubleCode>, Error> {
        let service = if pending { 0x07 } else { 0x03 };
        let response = self.obd_query(service, &[])?;

        if response.is_empty() {
            return Ok(Vec::new());
        }
        let data = &response[1..];

        let mut dtcs = Vec::new();
        for chunk in data.chunks_exact(2) {
            dtcs.push(DiagnosticTroubleCode::from_bytes([chunk[0], chunk[1]]));
        }
        Ok(dtcs)
    }

    fn clear_dtcs(&mut self) -> Result<(), Error> {
        self.obd_query(0x04, &[])?;
        Ok(())
    }

    fn read_data(&mut self, pid: u8, freeze_frame: bool) -> Result<Vec<u8>, Error> {
        let service = if freeze_frame { 0x02 } else { 0x01 };
        self.obd_query(service, &[pid])
    }

    fn read_data_formatted(&mut self, pid: u8, freeze_frame: bool) -> Result<String, Error> {
        let data = self.read_data(pid, freeze_frame)?;
        Ok(format_pid(pid, &data))
    }
}

/// Render a raw PID payload per the standard SAE J1979 table. Unknown PIDs
/// fall back to a hex dump.
fn format_pid(pid: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return "<no data>".to_string();
    }
    match pid {
        0x02 if data.len() >= 2 => {
            format!(
                "Freeze DTC: {}",
                DiagnosticTroubleCode::from_bytes([data[0], data[1]])
            )
        }
        0x04 => format!("Calculated engine load: {:6.2} %", data[0] as f32 / 2.55),
        0x05 => format!("Engine coolant temperature: {:3} C", data[0] as i16 - 40),
        0x06 | 0x07 | 0x08 | 0x09 => format!(
            "{} term fuel trim - Bank {}: {:7.2} %",
            if pid == 0x06 || pid == 0x08 { "Short" } else { "Long" },
            if pid >= 0x08 { 2 } else { 1 },
            data[0] as f32 / 1.25 - 100.0
        ),
        0x0a => format!("Fuel pressure: {:3} kPa", data[0] as u16 * 3),
        0x0b => format!("Intake manifold absolute pressure: {:3} kPa", data[0]),
        0x0c if data.len() >= 2 => format!(
            "Engine speed: {:8.2} rpm",
            (256.0 * data[0] as f32 + data[1] as f32) / 4.0
        ),
        0x0d => format!("Vehicle speed: {:3} km/h", data[0]),
        0x0e => format!(
            "Timing advance: {:5.1} deg before TDC",
            (data[0] as f32) / 2.0 - 64.0
        ),
        0x0f => format!("Intake air temperature: {:3} C", data[0] as i16 - 40),
        0x10 if data.len() >= 2 => format!(
            "MAF air flow rate: {:6.2} g/s",
            (256.0 * data[0] as f32 + data[1] as f32) / 100.0
        ),
        0x11 => format!("Throttle position: {:3.0} %", data[0] as f32 / 2.55),
        0x14..=0x1b if data.len() >= 2 => {
            let id = pid - 0x13;
            if data[1] == 0xff {
                format!(
                    "Oxygen Sensor {}: {:5.3} V, N/A %",
                    id,
                    data[0] as f32 / 200.0
                )
            } else {
                format!(
                    "Oxygen Sensor {}: {:5.3} V, {:7.2} %",
                    id,
                    data[0] as f32 / 200.0,
                    data[1] as f32 / 1.28 - 100.0
                )
            }
        }
        0x1f if data.len() >= 2 => format!(
            "Run time since engine start: {:5} s",
            ((data[0] as u16) << 8) + data[1] as u16
        ),
        0x21 if data.len() >= 2 => format!(
            "Distance traveled with MIL on: {:5} km",
            ((data[0] as u16) << 8) + data[1] as u16
        ),
        0x2c => format!("Commanded EGR: {:6.2} %", data[0] as f32 / 2.55),
        0x2d => format!("EGR error: {:7.2} %", data[0] as f32 / 1.28 - 100.0),
        0x2f => format!("Fuel tank level input: {:6.2} %", data[0] as f32 / 2.55),
        0x33 => format!("Absolute barometric pressure: {:3} kPa", data[0]),
        0x42 if data.len() >= 2 => format!(
            "Control module voltage: {:6.3} V",
            (data[0] as f32 * 256.0 + data[1] as f32) / 1000.0
        ),
        0x46 => format!("Ambient air temperature: {:3} C", data[0] as i16 - 40),
        0x5c => format!("Engine oil temperature: {:3} C", data[0] as i16 - 40),
        0xa6 if data.len() >= 4 => format!(
            "Odometer: {:6} km",
            ((data[0] as u64) << 24)
                + ((data[1] as u64) << 16)
                + ((data[2] as u64) << 8)
                + data[3] as u64
        ),
        _ => format!("{:02x?}", data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::MockCanPort;

    #[test]
    fn read_vin_decodes_multi_frame_response() {
        // S5: broadcast at 0x7DF, peer replies first-frame + consecutive
        // frames carrying 0x49 0x02 0x01 followed by the 17-char VIN.
        let client_port = MockCanPort::endpoint();
        let ecu_port = MockCanPort::endpoint();
        client_port.connect(&ecu_port);

        let vin = b"WVWZZZ1KZAW123456";
        std::thread::spawn(move || {
            let request = ecu_port.recv(Duration::from_millis(500)).unwrap().unwrap();
            assert_eq!(request.id(), BROADCAST_ID);

            let mut payload = vec![0x49, 0x02, 0x01];
            payload.extend_from_slice(vin);

            let mut first = vec![0x10, payload.len() as u8];
            first.extend_from_slice(&payload[..5]);
            ecu_port
                .send(&CanFrame::new(0x7E8, first).unwrap())
                .unwrap();

            let fc = ecu_port.recv(Duration::from_millis(500)).unwrap().unwrap();
            assert_eq!(fc.id(), 0x7E0);

            let mut remaining = payload[5..].to_vec();
            let mut seq = 1u8;
            while !remaining.is_empty() {
                let take = remaining.len().min(7);
                let mut frame = vec![0x20 | seq];
                frame.extend(remaining.drain(..take));
                ecu_port
                    .send(&CanFrame::new(0x7E8, frame).unwrap())
                    .unwrap();
                seq = (seq + 1) % 16;
            }
        });

        let mut client = ObdClient::without_discovery(client_port);
        let result = client.read_vin().unwrap();
        assert_eq!(result, String::from_utf8(vin.to_vec()).unwrap());
    }

    #[test]
    fn obd_query_returns_timeout_when_nothing_answers() {
        let port = MockCanPort::endpoint();
        let mut client = ObdClient::without_discovery(port);
        let err = client.obd_query(0x01, &[0x0d]).unwrap_err();
        assert!(matches!(err, Error::Obd(ObdError::Timeout)));
    }
}
