//! Serial link transport
//!
//! Wraps any split async byte stream; the production path opens the router's
//! UART with `tokio-serial`, tests plug in `tokio::io::duplex`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

use common::logging::BUS_TRAFFIC_TARGET;

use super::traits::{BusTransport, TransportCounters, TransportError, TransportStats};

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialLinkConfig {
    /// Serial port path (e.g., "/dev/ttyAMA0")
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity ("None", "Even", "Odd")
    pub parity: String,
    /// Flow control ("None", "Software", "Hardware")
    pub flow_control: String,
    pub write_timeout_ms: u64,
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: "Even".to_string(),
            flow_control: "None".to_string(),
            write_timeout_ms: 1000,
        }
    }
}

impl SerialLinkConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::Config(
                "Port path cannot be empty".to_string(),
            ));
        }

        if self.baud_rate == 0 {
            return Err(TransportError::Config(
                "Baud rate must be greater than zero".to_string(),
            ));
        }

        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(TransportError::Config(
                "Data bits must be 5, 6, 7, or 8".to_string(),
            ));
        }

        if ![1, 2].contains(&self.stop_bits) {
            return Err(TransportError::Config(
                "Stop bits must be 1 or 2".to_string(),
            ));
        }

        if !["None", "Even", "Odd"].contains(&self.parity.as_str()) {
            return Err(TransportError::Config(
                "Parity must be None, Even, or Odd".to_string(),
            ));
        }

        if !["None", "Software", "Hardware"].contains(&self.flow_control.as_str()) {
            return Err(TransportError::Config(
                "Flow control must be None, Software, or Hardware".to_string(),
            ));
        }

        if self.write_timeout_ms == 0 {
            return Err(TransportError::Config(
                "Write timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn parse_parity(&self) -> tokio_serial::Parity {
        match self.parity.as_str() {
            "Even" => tokio_serial::Parity::Even,
            "Odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    fn parse_flow_control(&self) -> tokio_serial::FlowControl {
        match self.flow_control.as_str() {
            "Software" => tokio_serial::FlowControl::Software,
            "Hardware" => tokio_serial::FlowControl::Hardware,
            _ => tokio_serial::FlowControl::None,
        }
    }

    fn parse_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn parse_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

/// Open the router UART
pub fn open_serial(
    config: &SerialLinkConfig,
) -> Result<StreamTransport<ReadHalf<SerialStream>, WriteHalf<SerialStream>>, TransportError> {
    config.validate()?;
    debug!("Opening serial port: {}", config.port);

    let port = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(config.parse_data_bits())
        .parity(config.parse_parity())
        .stop_bits(config.parse_stop_bits())
        .flow_control(config.parse_flow_control())
        .open_native_async()
        .map_err(|e| {
            let error_msg = format!("Failed to open serial port {}: {e}", config.port);
            error!("{error_msg}");
            TransportError::ConnectionFailed(error_msg)
        })?;

    #[cfg(unix)]
    let port = {
        let mut port = port;
        port.set_exclusive(true).map_err(|e| {
            TransportError::Io(format!("Failed to set exclusive mode: {e}"))
        })?;
        port
    };

    info!(
        "Opened serial port {} at {} baud",
        config.port, config.baud_rate
    );
    let (reader, writer) = tokio::io::split(port);
    Ok(StreamTransport::new(
        config.port.clone(),
        reader,
        writer,
        config.write_timeout(),
    ))
}

/// Transport over separately locked read and write halves
pub struct StreamTransport<R, W> {
    name: String,
    reader: Mutex<R>,
    writer: Mutex<W>,
    write_timeout: Duration,
    counters: TransportCounters,
}

impl<R, W> StreamTransport<R, W> {
    pub fn new(name: impl Into<String>, reader: R, writer: W, write_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            write_timeout,
            counters: TransportCounters::default(),
        }
    }
}

impl<R, W> fmt::Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("name", &self.name)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<R, W> BusTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let send_operation = async {
            writer.write_all(data).await?;
            writer.flush().await
        };

        match timeout(self.write_timeout, send_operation).await {
            Ok(Ok(())) => {
                self.counters.record_sent(data.len());
                debug!(
                    target: BUS_TRAFFIC_TARGET,
                    direction = "send",
                    length = data.len(),
                    "{}",
                    common::hex::encode_spaced(data)
                );
                Ok(())
            },
            Ok(Err(e)) => {
                error!("Failed to send data on {}: {e}", self.name);
                Err(TransportError::from_io(e))
            },
            Err(_) => {
                warn!(
                    "Send operation on {} timed out after {:?}",
                    self.name, self.write_timeout
                );
                Err(TransportError::Timeout(self.write_timeout))
            },
        }
    }

    async fn read_exact(
        &self,
        buf: &mut [u8],
        read_timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let mut reader = self.reader.lock().await;
        let result = match read_timeout {
            Some(limit) => match timeout(limit, reader.read_exact(buf)).await {
                Ok(result) => result,
                Err(_) => return Err(TransportError::Timeout(limit)),
            },
            None => reader.read_exact(buf).await,
        };

        match result {
            Ok(_) => {
                self.counters.record_received(buf.len());
                debug!(
                    target: BUS_TRAFFIC_TARGET,
                    direction = "recv",
                    length = buf.len(),
                    "{}",
                    common::hex::encode_spaced(buf)
                );
                Ok(())
            },
            Err(e) => Err(TransportError::from_io(e)),
        }
    }

    async fn discard_pending(&self) -> Result<usize, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut scratch = [0u8; 256];
        let mut total = 0usize;
        // Whatever the router still has queued arrives within a few ms
        loop {
            match timeout(Duration::from_millis(20), reader.read(&mut scratch)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => return Err(TransportError::from_io(e)),
                Err(_) => break,
            }
        }
        if total > 0 {
            self.counters.record_discarded(total);
            debug!("Discarded {} pending bytes on {}", total, self.name);
        }
        Ok(total)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn duplex_transport() -> (
        StreamTransport<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>>,
        tokio::io::DuplexStream,
    ) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(ours);
        (
            StreamTransport::new("duplex", r, w, Duration::from_millis(200)),
            theirs,
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(SerialLinkConfig::default().validate().is_ok());

        let config = SerialLinkConfig {
            port: String::new(),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(TransportError::Config("Port path cannot be empty".to_string()))
        );

        let config = SerialLinkConfig {
            parity: "Mark".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SerialLinkConfig {
            data_bits: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_write_and_read_exact() {
        let (transport, mut peer) = duplex_transport();

        transport.write_all(&[0x2A, 0x01, 0x05]).await.unwrap();
        let mut echoed = [0u8; 3];
        peer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [0x2A, 0x01, 0x05]);

        peer.write_all(&[1, 2, 3, 4]).await.unwrap();
        let mut buf = [0u8; 4];
        transport
            .read_exact(&mut buf, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        let stats = transport.stats();
        assert_eq!(stats.bytes_sent, 3);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (transport, _peer) = duplex_transport();
        let mut buf = [0u8; 1];
        let result = transport
            .read_exact(&mut buf, Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_peer_close_is_link_closed() {
        let (transport, peer) = duplex_transport();
        drop(peer);
        let mut buf = [0u8; 2];
        let result = transport.read_exact(&mut buf, None).await;
        assert!(matches!(result, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let (transport, mut peer) = duplex_transport();
        peer.write_all(&[9u8; 40]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.discard_pending().await.unwrap(), 40);
        assert_eq!(transport.stats().bytes_discarded, 40);
    }
}
