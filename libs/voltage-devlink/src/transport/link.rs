//! Device links
//!
//! A `DeviceLink` is an open byte stream to a device (TCP socket or serial
//! port). It knows how to dial and how to run one request/response exchange
//! under a deadline; it keeps no health state of its own.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

#[cfg(feature = "rtu")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::frame::{self, MbapHeader, Request, MBAP_HEADER_LEN};
use crate::connection::{ConnectionConfig, TransportConfig};
use crate::error::{DevLinkError, Result};

/// Open link to a device
#[derive(Debug)]
pub enum DeviceLink {
    Tcp(TcpStream),
    #[cfg(feature = "rtu")]
    Rtu(SerialStream),
}

impl DeviceLink {
    /// Dial the transport described by `config` within its timeout
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        match &config.transport {
            TransportConfig::Tcp { host, port } => {
                Self::connect_tcp(host, *port, config.timeout()).await
            },
            #[cfg(feature = "rtu")]
            TransportConfig::Rtu {
                device,
                baud_rate,
                parity,
                data_bits,
                stop_bits,
            } => Self::open_rtu(device, *baud_rate, *parity, *data_bits, *stop_bits, config.timeout()),
            #[cfg(not(feature = "rtu"))]
            TransportConfig::Rtu { device, .. } => Err(DevLinkError::config(format!(
                "serial link {device} needs the `rtu` feature"
            ))),
        }
    }

    async fn connect_tcp(host: &str, port: u16, timeout_duration: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!("TCP connecting: {}", addr);

        match timeout(timeout_duration, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(DeviceLink::Tcp(stream))
            },
            Ok(Err(e)) => {
                warn!("TCP err: {} - {}", addr, e);
                Err(DevLinkError::transport(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(DevLinkError::timeout(format!(
                    "Connection to {addr} timed out"
                )))
            },
        }
    }

    #[cfg(feature = "rtu")]
    fn open_rtu(
        device: &str,
        baud_rate: u32,
        parity: crate::connection::Parity,
        data_bits: u8,
        stop_bits: u8,
        timeout_duration: Duration,
    ) -> Result<Self> {
        use crate::connection::Parity;

        debug!("RTU: {} @{}baud", device, baud_rate);

        let parity = match parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(device, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(timeout_duration)
            .open_native_async()
        {
            Ok(port) => {
                info!("RTU opened: {}", device);
                Ok(DeviceLink::Rtu(port))
            },
            Err(e) => {
                warn!("RTU err: {} - {}", device, e);
                Err(DevLinkError::transport(format!(
                    "Failed to open serial port {device}: {e}"
                )))
            },
        }
    }

    /// Send `request` and wait for its response, all within `deadline`.
    ///
    /// Returns the words carried by a read response, empty for writes.
    pub async fn exchange(
        &mut self,
        transaction_id: u16,
        unit_id: u8,
        request: &Request,
        deadline: Duration,
    ) -> Result<Vec<u16>> {
        let function = request.function();
        let outcome = match self {
            DeviceLink::Tcp(stream) => {
                timeout(
                    deadline,
                    exchange_tcp(stream, transaction_id, unit_id, request),
                )
                .await
            },
            #[cfg(feature = "rtu")]
            DeviceLink::Rtu(port) => timeout(deadline, exchange_rtu(port, unit_id, request)).await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!("{} unit {} timeout after {:?}", function, unit_id, deadline);
                Err(DevLinkError::timeout(format!(
                    "{function} to unit {unit_id} timed out after {}ms",
                    deadline.as_millis()
                )))
            },
        }
    }

    /// Best-effort close
    pub async fn close(self) {
        match self {
            DeviceLink::Tcp(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    trace!("TCP shutdown: {}", e);
                }
            },
            #[cfg(feature = "rtu")]
            DeviceLink::Rtu(_) => {},
        }
    }
}

async fn exchange_tcp(
    stream: &mut TcpStream,
    transaction_id: u16,
    unit_id: u8,
    request: &Request,
) -> Result<Vec<u16>> {
    let frame = frame::encode_tcp(transaction_id, unit_id, request);
    trace!("TCP TX: {:02X?}", &frame[..]);
    stream.write_all(&frame).await?;

    loop {
        let mut raw = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut raw).await?;
        let header = MbapHeader::decode(&raw);

        let mut pdu = vec![0u8; header.pdu_len()?];
        stream.read_exact(&mut pdu).await?;
        trace!("TCP RX: {:02X?} {:02X?}", raw, pdu);

        if header.transaction_id != transaction_id {
            // Late answer to a request that already timed out
            debug!(
                "Discarding stale frame: tid={:04X}, expected {:04X}",
                header.transaction_id, transaction_id
            );
            continue;
        }
        if header.unit_id != unit_id {
            return Err(DevLinkError::invalid_response(format!(
                "unit mismatch: sent {unit_id}, got {}",
                header.unit_id
            )));
        }
        return request.parse_response(&pdu);
    }
}

#[cfg(feature = "rtu")]
async fn exchange_rtu(port: &mut SerialStream, unit_id: u8, request: &Request) -> Result<Vec<u16>> {
    let frame = frame::encode_rtu(unit_id, request);
    trace!("RTU TX: {:02X?}", &frame[..]);
    port.write_all(&frame).await?;
    port.flush().await?;

    let mut head = [0u8; 3];
    port.read_exact(&mut head).await?;
    let mut response = head.to_vec();
    response.resize(3 + frame::rtu_remaining_len(head), 0);
    port.read_exact(&mut response[3..]).await?;
    trace!("RTU RX: {:02X?}", response);

    let (unit, pdu) = frame::decode_rtu(&response)?;
    if unit != unit_id {
        return Err(DevLinkError::invalid_response(format!(
            "unit mismatch: sent {unit_id}, got {unit}"
        )));
    }
    request.parse_response(pdu)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::frame::FunctionCode;
    use tokio::net::TcpListener;

    async fn read_request(socket: &mut TcpStream) -> (u16, Vec<u8>) {
        let mut header = [0u8; MBAP_HEADER_LEN];
        socket.read_exact(&mut header).await.unwrap();
        let header = MbapHeader::decode(&header);
        let mut pdu = vec![0u8; header.pdu_len().unwrap()];
        socket.read_exact(&mut pdu).await.unwrap();
        (header.transaction_id, pdu)
    }

    fn response(tid: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(pdu);
        frame
    }

    #[tokio::test]
    async fn test_exchange_skips_stale_transaction() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (tid, _) = read_request(&mut socket).await;
            // A late answer for an older request arrives first
            socket
                .write_all(&response(tid.wrapping_sub(1), 1, &[0x03, 0x02, 0xDE, 0xAD]))
                .await
                .unwrap();
            socket
                .write_all(&response(tid, 1, &[0x03, 0x02, 0x00, 0x2A]))
                .await
                .unwrap();
        });

        let config = ConnectionConfig::tcp("sim", "127.0.0.1", port);
        let mut link = DeviceLink::open(&config).await.unwrap();
        let request = Request::read(FunctionCode::ReadHoldingRegisters, 0, 1).unwrap();
        let words = link
            .exchange(5, 1, &request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(words, vec![42]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let config = ConnectionConfig::tcp("sim", "127.0.0.1", port);
        let mut link = DeviceLink::open(&config).await.unwrap();
        let request = Request::read(FunctionCode::ReadHoldingRegisters, 0, 1).unwrap();
        let err = link
            .exchange(1, 1, &request, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DevLinkError::Timeout(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig::tcp("sim", "127.0.0.1", port);
        let err = DeviceLink::open(&config).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[cfg(not(feature = "rtu"))]
    #[tokio::test]
    async fn test_open_serial_without_feature() {
        let config = ConnectionConfig::rtu("bms", "/dev/ttyUSB0", 9600);
        assert!(matches!(
            DeviceLink::open(&config).await,
            Err(DevLinkError::Config(_))
        ));
    }
}
