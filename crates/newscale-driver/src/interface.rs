//! Hardware interfaces through which stages are reached.
//!
//! One [`Interface`] owns one physical link (USB serial or PoE TCP) and
//! the address-multiplexing discipline for the stages behind it. The
//! wire is half-duplex with no request tags, so exactly one
//! write-then-read exchange may be active per link at a time; the inner
//! mutex enforces that, and poll loops re-acquire it per query so a slow
//! axis never starves its siblings between polls.
//!
//! Multiple stage drivers clone the same `Interface`; the type-erased
//! stream seam means tests drive it with `tokio::io::duplex` in place of
//! real hardware.

use crate::error::StageError;
use newscale_protocol::{ProtocolError, TransceiverCommand, TransceiverReply, TERMINATOR};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Trait alias for async stream I/O. Satisfied by
/// `tokio_serial::SerialStream`, `tokio::net::TcpStream`, and
/// `tokio::io::DuplexStream` alike.
pub trait StreamIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIO for T {}

/// Type-erased boxed stream.
pub type DynStream = Box<dyn StreamIO>;

/// New Scale USB vendor/product IDs, for port discovery.
pub const VID_NEWSCALE: u16 = 0x10C4;
pub const PID_NEWSCALE_COMPORT: u16 = 0xEA60;

/// Default TCP port of the M3-PoE transceiver.
pub const DEFAULT_POE_PORT: u16 = 23;

/// Default baud rate of the New Scale USB hub.
pub const DEFAULT_BAUD: u32 = 250_000;

/// Axis address on a shared transceiver link, rendered as two upper-case
/// hex digits on the wire (`01`, `02`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u8);

impl Address {
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

impl FromStr for Address {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u8::from_str_radix(s, 16).map(Self)
    }
}

struct Link {
    stream: BufReader<DynStream>,
    /// Address the transceiver is currently routing stage frames to.
    selected: Option<Address>,
}

/// One physical link to a transceiver and the stages behind it.
///
/// Clones share the link; drop all clones to close it.
#[derive(Clone)]
pub struct Interface {
    link: Arc<Mutex<Link>>,
    label: Arc<str>,
}

impl Interface {
    /// Open a serial connection to a USB transceiver. Standard settings:
    /// 8N1, no flow control.
    pub async fn serial(port_path: &str, baud: u32) -> Result<Self, StageError> {
        use tokio_serial::SerialPortBuilderExt;

        let path = port_path.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(StageError::connection)?
        .map_err(StageError::connection)?;

        tracing::info!(port = port_path, baud, "opened serial interface");
        Ok(Self::from_stream(stream, port_path))
    }

    /// Connect to a PoE transceiver over TCP.
    pub async fn poe(host: &str, port: u16) -> Result<Self, StageError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(StageError::connection)?;
        tracing::info!(host, port, "opened PoE interface");
        Ok(Self::from_stream(stream, host))
    }

    /// Wrap an arbitrary async stream (tests, simulators).
    pub fn from_stream<S: StreamIO + 'static>(stream: S, label: &str) -> Self {
        Self {
            link: Arc::new(Mutex::new(Link {
                stream: BufReader::new(Box::new(stream)),
                selected: None,
            })),
            label: Arc::from(label),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether two interfaces are clones of the same physical link.
    pub fn shares_link_with(&self, other: &Interface) -> bool {
        Arc::ptr_eq(&self.link, &other.link)
    }

    /// One full request/response cycle addressed to a stage.
    ///
    /// If `address` is given and differs from the link's current routing,
    /// a `TR<A0>` stage-select exchange runs first and its echo is
    /// verified; a mismatched echo is an error, never silently accepted.
    /// The link mutex is held for the whole cycle and released on return.
    pub async fn transact(
        &self,
        address: Option<Address>,
        frame: &str,
        timeout: Duration,
    ) -> Result<String, StageError> {
        let mut link = self.link.lock().await;
        if let Some(addr) = address {
            if link.selected != Some(addr) {
                Self::select(&mut link, addr, timeout).await?;
            }
        }
        Self::exchange(&mut link, frame, timeout).await
    }

    /// One request/response cycle addressed to the transceiver itself.
    pub async fn transceiver_transact(
        &self,
        command: &TransceiverCommand,
        timeout: Duration,
    ) -> Result<TransceiverReply, StageError> {
        let mut link = self.link.lock().await;
        let raw = Self::exchange(&mut link, &command.encode(), timeout).await?;
        Ok(TransceiverReply::decode(&raw)?)
    }

    async fn select(link: &mut Link, address: Address, timeout: Duration) -> Result<(), StageError> {
        let frame = TransceiverCommand::StageSelect {
            address: address.value(),
        }
        .encode();
        let raw = Self::exchange(link, &frame, timeout).await?;
        match TransceiverReply::decode(&raw)? {
            TransceiverReply::StageSelect { address: echo, .. } if echo == address.value() => {
                link.selected = Some(address);
                Ok(())
            }
            TransceiverReply::StageSelect { address: echo, .. } => {
                // Routing state is now unknown; force a reselect next time.
                link.selected = None;
                Err(StageError::WrongAddress {
                    expected: address,
                    got: Address::new(echo),
                })
            }
            _ => Err(StageError::Protocol(ProtocolError::Malformed {
                raw,
                reason: "unexpected reply to stage select",
            })),
        }
    }

    async fn exchange(link: &mut Link, frame: &str, timeout: Duration) -> Result<String, StageError> {
        tracing::trace!(frame = frame.trim_end(), "tx");
        link.stream
            .get_mut()
            .write_all(frame.as_bytes())
            .await
            .map_err(StageError::connection)?;
        link.stream
            .get_mut()
            .flush()
            .await
            .map_err(StageError::connection)?;
        Self::read_reply(link, timeout).await
    }

    async fn read_reply(link: &mut Link, timeout: Duration) -> Result<String, StageError> {
        let mut buf = Vec::with_capacity(64);
        let n = tokio::time::timeout(timeout, link.stream.read_until(TERMINATOR, &mut buf))
            .await
            .map_err(|_| StageError::Timeout { timeout })?
            .map_err(StageError::connection)?;
        if n == 0 {
            return Err(StageError::Connection("link closed".to_string()));
        }
        let text = String::from_utf8(buf).map_err(|_| {
            StageError::Protocol(ProtocolError::Malformed {
                raw: String::new(),
                reason: "reply is not valid ASCII",
            })
        })?;
        tracing::trace!(reply = text.trim_end(), "rx");
        Ok(text)
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface").field("label", &self.label).finish()
    }
}

/// Enumerate serial ports that look like New Scale USB hubs.
pub fn discover_serial_ports() -> Result<Vec<String>, StageError> {
    let ports = serialport::available_ports().map_err(StageError::connection)?;
    Ok(ports
        .into_iter()
        .filter_map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(info)
                if info.vid == VID_NEWSCALE && info.pid == PID_NEWSCALE_COMPORT =>
            {
                Some(p.port_name)
            }
            _ => None,
        })
        .collect())
}
