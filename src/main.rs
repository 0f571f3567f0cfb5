use std::fs::File;
use std::io::{stdout, Write};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use colored::*;
use docopt::Docopt;
use env_logger;
use log::{debug, error, info, Level, LevelFilter};
use serde::{de, Deserialize, Deserializer};

use vwdiag::can::{CanFrame, CanPort, SocketCanPort};
use vwdiag::dtc::Diagnose;
use vwdiag::error::Error;
use vwdiag::kwp2000::KwpSession;
use vwdiag::misc::confirm;
use vwdiag::obd2::ObdClient;
use vwdiag::security::{SeedKeyAlgorithm, XorRotateKey};
use vwdiag::vwtp::VwtpStack;

const VERSION: &'static str = "v0.1";
const USAGE: &'static str = "
Usage:
    vwdiag vwtp connect <module> [--mode=<mode>] [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag vwtp request <module> <service> [<params>...] [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag vwtp security-access <module> <level> [--ecu-index=<idx>] [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag vwtp simulator [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag obd2 read-dtcs [-v] [--bitrate=<bps>] [--iface=<iface>] [--pending]
    vwdiag obd2 clear-dtcs [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag obd2 read-data <pid> [-v] [-t [--log=<logfile>]] [--freeze-frame] [--iface=<iface>]
    vwdiag obd2 read-vin [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag obd2 simulator [-v] [--bitrate=<bps>] [--iface=<iface>]
    vwdiag (-h | --help)
    vwdiag --version

Args:
    <module>             VWTP module id to connect to, e.g. 0x01 for the
                            engine control unit.
    <pid>                 OBD-II parameter id to read.
    <service>             KWP2000 service name from the standard catalog,
                            e.g. startDiagnosticSession, readEcuIdentification.
    <params>              Raw hex bytes (no '0x' prefix) making up the
                            request parameters, e.g. 89 for a DIAG session.
    <level>               Security access level request byte.

Commands:
    connect               Open a VWTP channel to <module> and start a
                            KWP2000 diagnostic session (keeping tester-present
                            alive until Ctrl-C).
    request                Send one KWP2000 request by symbolic service name.
    security-access        Perform the seed/key security-access challenge for
                            the given level.
    read-dtcs              Read Diagnostic Trouble Codes over generic OBD-II.
    clear-dtcs              Clear Diagnostic Trouble Codes over generic OBD-II.
    read-data               Read either current or freeze frame data for a
                            given PID.
    read-vin                Read the vehicle's VIN (service 9, PID 2).
    simulator               Play the ECU side of the VWTP handshake and a
                            couple of OBD-II services, for exercising the
                            stack without a vehicle.

Options:
    -h --help             Show usage information.
    --version              Show version.
    -v --verbose           Show more output.
    --iface=<iface>        CAN interface name. Defaults to can0.
    --bitrate=<bps>        CAN bit rate. Defaults to 500,000.
    --mode=<mode>          Diagnostic session mode byte. Defaults to 0x89.
    --ecu-index=<idx>      Seed/key table index. Defaults to 0.
    --pending               Read pending DTCs instead of stored ones.
    -t --tail               Keep requerying data.
    -l --log=<logfile>     Write floating point values to CSV file.
    --freeze-frame          Query data from freeze frame.

For more information on OBD2 PIDs, consult resources such as:
    https://en.wikipedia.org/wiki/OBD-II_PIDs#Service_01
";

#[derive(Clone, Debug, Eq, PartialEq)]
struct HexInput8 {
    value: u8,
}

impl<'de> Deserialize<'de> for HexInput8 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let value = if s.len() >= 2 && &s[0..2] == "0x" {
            u8::from_str_radix(&s[2..], 16).map_err(de::Error::custom)?
        } else {
            u8::from_str_radix(&s, 10).map_err(de::Error::custom)?
        };

        Ok(Self { value })
    }
}

impl Deref for HexInput8 {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Parse a whitespace-free run of hex pairs ("108902" -> [0x10, 0x89, 0x02]).
fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, Error> {
    if s.len() % 2 != 0 {
        return Err(Error::Other(format!(
            "hex byte string {:?} has an odd length",
            s
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Error::from))
        .collect()
}

/// CLI args
#[derive(Debug, Deserialize)]
struct Args {
    cmd_vwtp: bool,
    cmd_obd2: bool,
    cmd_connect: bool,
    cmd_request: bool,
    cmd_security_access: bool,
    cmd_simulator: bool,
    cmd_read_dtcs: bool,
    cmd_clear_dtcs: bool,
    cmd_read_data: bool,
    cmd_read_vin: bool,
    arg_module: Option<HexInput8>,
    arg_pid: Option<HexInput8>,
    arg_service: Option<String>,
    arg_params: Vec<String>,
    arg_level: Option<HexInput8>,
    flag_verbose: bool,
    flag_iface: Option<String>,
    flag_bitrate: Option<u64>,
    flag_mode: Option<HexInput8>,
    flag_ecu_index: Option<HexInput8>,
    flag_pending: bool,
    flag_freeze_frame: bool,
    flag_tail: bool,
    flag_log: Option<String>,
}

fn iface(args: &Args) -> &str {
    args.flag_iface.as_deref().unwrap_or("can0")
}

fn init_obd2(args: &Args) -> Result<ObdClient<SocketCanPort>, Error> {
    let port = SocketCanPort::init(iface(args), args.flag_bitrate)?;
    Ok(ObdClient::new(port)?)
}

fn init_vwtp_session(args: &Args) -> Result<(u8, Arc<KwpSession>), Error> {
    let module = *args.arg_module.clone().unwrap();
    let port = SocketCanPort::init(iface(args), args.flag_bitrate)?;
    let stack = VwtpStack::new(Arc::new(port));
    let channel = stack.connect(module, 1)?;
    Ok((module, KwpSession::new(channel)))
}

fn cmd_connect(args: Args) -> Result<(), Error> {
    let mode = args.flag_mode.clone().map(|x| *x).unwrap_or(0x89);
    let (module, session) = init_vwtp_session(&args)?;

    let resp = session.begin(&[mode])?;
    info!("diagnostic session established: {:02x?}", resp);
    println!(
        "{}: module 0x{:02x}, response {:02x?}",
        "Session active".green().bold(),
        module,
        resp
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .unwrap();

    println!("Tester-present loop running. Press Ctrl-C to disconnect.");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    session.close();
    Ok(())
}

fn cmd_request(args: Args) -> Result<(), Error> {
    let service = args.arg_service.clone().unwrap();
    let params = args
        .arg_params
        .iter()
        .map(|s| parse_hex_bytes(s))
        .collect::<Result<Vec<_>, _>>()?
        .concat();

    let (_, session) = init_vwtp_session(&args)?;
    let resp = session.request(&service, &params)?;
    println!("{}: {:02x?}", "Response".green().bold(), resp);

    Ok(())
}

fn cmd_security_access(args: Args) -> Result<(), Error> {
    let level = *args.arg_level.clone().unwrap();
    let ecu_index = args.flag_ecu_index.clone().map(|x| *x).unwrap_or(0);

    if !confirm(format!("{}: Performing a security-access challenge unlocks privileged ECU operations.\nAre you sure you wish to proceed?", "CAUTION".bold().red()))? {
        return Err(Error::Other("Aborting.".into()));
    }

    let (_, session) = init_vwtp_session(&args)?;

    let seed_resp = session.request("securityAccess", &[level])?;
    if seed_resp.len() < 6 {
        return Err(Error::Other(
            "security access seed response too short".into(),
        ));
    }
    let seed = u32::from_be_bytes([seed_resp[2], seed_resp[3], seed_resp[4], seed_resp[5]]);

    let key = if level == 4 {
        XorRotateKey::read_only_key(seed)
    } else {
        XorRotateKey.compute_key(seed, ecu_index)?
    };

    let key_resp = session.request(
        "securityAccess",
        &[&[level + 1], &key.to_be_bytes()[..]].concat(),
    )?;
    println!(
        "{}: {:02x?}",
        "Security access granted".green().bold(),
        key_resp
    );

    Ok(())
}

fn cmd_read_dtcs(args: Args) -> Result<(), Error> {
    let mut client = init_obd2(&args)?;
    let dtcs = client.read_dtcs(args.flag_pending)?;

    if dtcs.len() == 0 {
        println!("\n{}", "No DTCs.".green().bold());
    }

    for (i, dtc) in dtcs.iter().enumerate() {
        println!(
            "\n{}: {}",
            format!("DTC #{}", i + 1).green().bold(),
            format!("{}", dtc).bold(),
        );
    }

    Ok(())
}

fn cmd_clear_dtcs(args: Args) -> Result<(), Error> {
    if !confirm(format!("{}: Clearing DTCs may mask an underlying issue.\nAre you sure you wish to proceed?", "CAUTION".bold().red()))? {
        return Err(Error::Other("Aborting.".into()));
    }

    let mut client = init_obd2(&args)?;
    client.clear_dtcs()?;

    println!("\n{}", "DTCs cleared successfully.".green().bold());
    println!("You may want to read the DTCs again to make sure errors have not reappeared.");

    Ok(())
}

fn cmd_read_data(args: Args) -> Result<(), Error> {
    let pid = *args.arg_pid.clone().unwrap();

    let mut client = init_obd2(&args)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .unwrap();

    println!("");

    let mut logfile = None;
    if let Some(p) = args.flag_log.clone() {
        logfile = Some(File::create(p)?);
    }

    let start = SystemTime::now();

    loop {
        let formatted = client.read_data_formatted(pid, args.flag_freeze_frame)?;

        if let Some(f) = logfile.as_mut() {
            f.write(
                format!("{},{}\n", start.elapsed().unwrap().as_secs_f32(), formatted).as_bytes(),
            )?;
        }

        print!(
            "\r{}: {}",
            format!("PID {} (0x{:02x})", pid, pid).green().bold(),
            formatted
        );

        if args.flag_verbose {
            println!("");
        }

        stdout().flush()?;

        if !args.flag_tail || !running.load(Ordering::SeqCst) {
            break;
        }
    }

    if !args.flag_verbose {
        println!("");
    }

    Ok(())
}

fn cmd_read_vin(args: Args) -> Result<(), Error> {
    let mut client = init_obd2(&args)?;
    let vin = client.read_vin()?;
    println!("{}: {}", "VIN".green().bold(), vin);
    Ok(())
}

/// Play the ECU side of the VWTP setup handshake and a couple of OBD-II
/// services on `iface`, for exercising the stack without a vehicle. Ported
/// in spirit from `rustbucket::can::CanBus::run_simulator`, generalized from
/// a single hardcoded ISO 9141 reply into the VWTP/OBD-II command set this
/// stack actually speaks.
fn cmd_simulator(args: Args) -> Result<(), Error> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .unwrap();

    let port = SocketCanPort::init(iface(&args), args.flag_bitrate)?;
    println!(
        "{} on {}. Press Ctrl-C to stop.",
        "Simulating ECU".green().bold(),
        iface(&args)
    );

    // Peer (our) VWTP address once a channel has been set up, and the
    // initiator's rx id we must address replies to.
    let mut channel: Option<(u16, u16)> = None; // (our_rx, initiator_rx)

    while running.load(Ordering::SeqCst) {
        let frame = match port.recv(Duration::from_millis(500))? {
            Some(f) => f,
            None => continue,
        };
        debug!("RECV {:02X}", frame);

        match frame.id() {
            0x200 => {
                if frame.data().get(1) == Some(&0xC0) {
                    let module = frame.data()[0];
                    let initiator_rx =
                        ((frame.data()[5] as u16) << 8) | frame.data()[4] as u16;
                    let our_rx = 0x740 + module as u16;
                    channel = Some((our_rx, initiator_rx));

                    let response = CanFrame::new(
                        0x200 + module as u16,
                        vec![
                            module,
                            0xD0,
                            0x00,
                            0x03,
                            (our_rx & 0xFF) as u8,
                            (our_rx >> 8) as u8,
                            0x01,
                        ],
                    )?;
                    port.send(&response)?;
                }
            }
            0x7DF | 0x7E0..=0x7E7 => simulate_obd2(&port, &frame)?,
            id if Some(id) == channel.map(|(rx, _)| rx) => {
                let (_, initiator_rx) = channel.unwrap();
                simulate_vwtp_data(&port, &frame, initiator_rx)?;
            }
            _ => {}
        }
    }

    Ok(())
}

fn simulate_vwtp_data(
    port: &SocketCanPort,
    frame: &CanFrame,
    initiator_rx: u16,
) -> Result<(), Error> {
    let data = frame.data();
    if data.is_empty() {
        return Ok(());
    }
    match data[0] {
        0xA0 => {
            // Parameter negotiation: block size 16, 100ms ack timeout, 5ms IFS.
            let response =
                CanFrame::new(initiator_rx, vec![0xA1, 0x0F, 0x8A, 0xFF, 0x32, 0xFF])?;
            port.send(&response)?;
        }
        0xA3 | 0xA8 => {}
        op if op & 0xF0 <= 0x30 => {
            // Single-frame KWP request: 2-byte length prefix, service + params.
            if data.len() < 4 {
                return Ok(());
            }
            let service = data[2];
            if op & 0x20 == 0 {
                let ack = 0xB0 | (((op & 0x0F) + 1) % 16);
                port.send(&CanFrame::new(initiator_rx, vec![ack])?)?;
            }

            let reply_body = match service {
                0x10 => vec![0x50, data.get(3).copied().unwrap_or(0x89)],
                0x3E => vec![0x7E],
                other => vec![other + 0x40],
            };
            let mut frame_data = vec![0x11];
            frame_data.extend_from_slice(&(reply_body.len() as u16).to_be_bytes());
            frame_data.extend_from_slice(&reply_body);
            let response = CanFrame::new(initiator_rx, frame_data)?;
            port.send(&response)?;
        }
        _ => {}
    }
    Ok(())
}

fn simulate_obd2(port: &SocketCanPort, frame: &CanFrame) -> Result<(), Error> {
    let data = frame.data();
    if data.len() < 3 {
        return Ok(());
    }
    let service = data[1];
    let pid = data[2];

    match (service, pid) {
        (0x01, 0x00) => {
            // Report support for PIDs 0x01..0x20 generically.
            let response = CanFrame::new(
                0x7E8,
                vec![0x06, 0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13],
            )?;
            port.send(&response)?;
        }
        (0x09, 0x02) => {
            let vin = b"WVWZZZ1KZAW123456";
            let mut payload = vec![0x49, 0x02, 0x01];
            payload.extend_from_slice(vin);

            let mut first = vec![0x10, payload.len() as u8];
            first.extend_from_slice(&payload[..5]);
            port.send(&CanFrame::new(0x7E8, first)?)?;

            let _fc = port.recv(Duration::from_millis(500))?;

            let mut remaining = payload[5..].to_vec();
            let mut seq = 1u8;
            while !remaining.is_empty() {
                let take = remaining.len().min(7);
                let mut chunk = vec![0x20 | seq];
                chunk.extend(remaining.drain(..take));
                port.send(&CanFrame::new(0x7E8, chunk)?)?;
                seq = (seq + 1) % 16;
            }
        }
        _ => {}
    }
    Ok(())
}

fn do_main() -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .map(|d| d.version(Some(VERSION.into())))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}: {}",
                match record.level() {
                    Level::Error => "error".bold().red(),
                    Level::Warn => "warn".bold().yellow(),
                    Level::Info => "info".bold().green(),
                    Level::Debug => "debug".bold().blue(),
                    Level::Trace => "trace".bold(),
                },
                record.args()
            )
        })
        .filter(
            None,
            if args.flag_verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            },
        )
        .init();

    if args.cmd_vwtp {
        if args.cmd_connect {
            cmd_connect(args)
        } else if args.cmd_request {
            cmd_request(args)
        } else if args.cmd_security_access {
            cmd_security_access(args)
        } else if args.cmd_simulator {
            cmd_simulator(args)
        } else {
            unreachable!()
        }
    } else if args.cmd_obd2 {
        if args.cmd_read_dtcs {
            cmd_read_dtcs(args)
        } else if args.cmd_clear_dtcs {
            cmd_clear_dtcs(args)
        } else if args.cmd_read_data {
            cmd_read_data(args)
        } else if args.cmd_read_vin {
            cmd_read_vin(args)
        } else if args.cmd_simulator {
            cmd_simulator(args)
        } else {
            unreachable!()
        }
    } else {
        unreachable!()
    }
}

fn main() {
    if let Err(e) = do_main() {
        error!("{}", e);
        std::process::exit(1);
    }
}
