//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Byte-level device transports and reachability checks."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::{ByteTransport, Result, TransportError};

/// Serial byte transport, 8-N-1 unless overridden.
#[derive(Debug)]
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    data_bits: tokio_serial::DataBits,
    parity: tokio_serial::Parity,
    stop_bits: tokio_serial::StopBits,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: tokio_serial::DataBits::Eight,
            parity: tokio_serial::Parity::None,
            stop_bits: tokio_serial::StopBits::One,
            stream: None,
        }
    }

    /// Override framing for devices that are not 8-N-1.
    pub fn with_framing(
        mut self,
        data_bits: tokio_serial::DataBits,
        parity: tokio_serial::Parity,
        stop_bits: tokio_serial::StopBits,
    ) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }
}

#[async_trait]
impl ByteTransport for SerialTransport {
    async fn connect(&mut self, _deadline: Duration) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        // Opening a serial device is local and effectively instant; failure
        // means the adapter is missing or locked, which is not transient in
        // the way a network outage is.
        let stream = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .open_native_async()
            .map_err(|err| TransportError::Unreachable(format!("{}: {}", self.path, err)))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match timeout(deadline, stream.read_exact(buf)).await {
            Err(_) => Err(TransportError::Timeout(deadline)),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.stream = None;
                Err(TransportError::Closed)
            }
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match timeout(deadline, stream.write_all(buf)).await {
            Err(_) => Err(TransportError::Timeout(deadline)),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn drain(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut scratch = [0u8; 256];
        while let Ok(Ok(n)) = timeout(Duration::from_millis(5), stream.read(&mut scratch)).await {
            if n == 0 {
                return;
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the stream releases the port lock.
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }
}
