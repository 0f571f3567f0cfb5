#![warn(missing_docs)]

/*!
 * Vehicle-diagnostic protocol stack for CAN-based Volkswagen-group vehicles
 * and generic OBD-II.
 *
 * [vwtp] implements VWTP 2.0, a connection-oriented transport layered on raw
 * CAN frames; [kwp2000] implements the KWP2000 diagnostic application layer
 * carried over a VWTP channel; [isotp] and [obd2] implement ISO-TP
 * segmentation and the generic OBD-II service/PID client used for legally
 * mandated emissions diagnostics. [security] implements the seed/key
 * security-access challenge KWP2000 uses to unlock privileged operations.
 *
 * Diagnosis functionality common to every protocol is implemented using the
 * [dtc::Diagnose] trait, while functionality common to OBD-II-shaped
 * protocols is implemented using [obd2::Obd2Protocol].
 */

pub mod can;
pub mod dtc;
pub mod error;
pub mod isotp;
pub mod kwp2000;
pub mod misc;
pub mod obd2;
pub mod security;
pub mod vwtp;
