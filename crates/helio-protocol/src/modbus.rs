//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Wire protocol codecs and register-group planning."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Modbus client over a byte transport.
//!
//! Supports FC03 (holding) and FC04 (input) reads in both framings: RTU
//! (CRC-16, poly 0xA001, low byte first on the wire) and TCP (MBAP header
//! with a monotonic transaction id per client).

use std::time::Duration;

use helio_transport::ByteTransport;
use tracing::trace;

use crate::registers::RegisterFunction;
use crate::{ProtocolError, Result};

/// Framing variant used by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusMode {
    Tcp,
    Rtu,
}

/// Compute the Modbus CRC-16 (polynomial 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Encode an RTU read request: unit, fc, start, count, CRC (LE).
pub fn encode_rtu_request(unit: u8, function: RegisterFunction, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(unit);
    frame.push(function.function_code());
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Encode a TCP (MBAP) read request.
pub fn encode_tcp_request(
    txn_id: u16,
    unit: u8,
    function: RegisterFunction,
    start: u16,
    count: u16,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&txn_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
    frame.extend_from_slice(&6u16.to_be_bytes()); // unit + pdu length
    frame.push(unit);
    frame.push(function.function_code());
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

/// One Modbus endpoint. Owns its transport exclusively; the worker that
/// created it is the only caller.
#[derive(Debug)]
pub struct ModbusClient {
    transport: Box<dyn ByteTransport>,
    mode: ModbusMode,
    unit_id: u8,
    next_txn_id: u16,
}

impl ModbusClient {
    pub fn new(transport: Box<dyn ByteTransport>, mode: ModbusMode, unit_id: u8) -> Self {
        Self {
            transport,
            mode,
            unit_id,
            next_txn_id: 0,
        }
    }

    pub async fn connect(&mut self, deadline: Duration) -> Result<()> {
        self.transport.connect(deadline).await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// RTT observed by the transport's last reachability probe, if any.
    pub fn measured_rtt(&self) -> Option<Duration> {
        self.transport.measured_rtt()
    }

    /// Read `count` registers starting at `start`. Returns the raw words
    /// or a typed error; an exception PDU is surfaced, never retried here.
    pub async fn read_registers(
        &mut self,
        function: RegisterFunction,
        start: u16,
        count: u16,
        deadline: Duration,
    ) -> Result<Vec<u16>> {
        trace!(fc = function.function_code(), start, count, "modbus read");
        match self.mode {
            ModbusMode::Rtu => self.read_rtu(function, start, count, deadline).await,
            ModbusMode::Tcp => self.read_tcp(function, start, count, deadline).await,
        }
    }

    async fn read_rtu(
        &mut self,
        function: RegisterFunction,
        start: u16,
        count: u16,
        deadline: Duration,
    ) -> Result<Vec<u16>> {
        // A late reply to a timed-out request must not be mistaken for the
        // answer to this one.
        self.transport.drain().await;

        let request = encode_rtu_request(self.unit_id, function, start, count);
        self.transport.write_all(&request, deadline).await?;

        let mut head = [0u8; 2];
        self.transport.read_exact(&mut head, deadline).await?;
        if head[0] != self.unit_id {
            return Err(ProtocolError::FrameMismatch(format!(
                "unit id {} in response, expected {}",
                head[0], self.unit_id
            )));
        }

        if head[1] == function.function_code() | 0x80 {
            let mut rest = [0u8; 3];
            self.transport.read_exact(&mut rest, deadline).await?;
            let expected = crc16(&[head[0], head[1], rest[0]]);
            let actual = u16::from_le_bytes([rest[1], rest[2]]);
            if expected != actual {
                return Err(ProtocolError::BadCrc { expected, actual });
            }
            return Err(ProtocolError::Exception { code: rest[0] });
        }

        if head[1] != function.function_code() {
            return Err(ProtocolError::FrameMismatch(format!(
                "function {:#04x} in response, expected {:#04x}",
                head[1],
                function.function_code()
            )));
        }

        let mut len_byte = [0u8; 1];
        self.transport.read_exact(&mut len_byte, deadline).await?;
        let byte_count = len_byte[0] as usize;
        if byte_count != count as usize * 2 {
            return Err(ProtocolError::FrameMismatch(format!(
                "byte count {} in response, expected {}",
                byte_count,
                count * 2
            )));
        }

        let mut body = vec![0u8; byte_count + 2];
        self.transport.read_exact(&mut body, deadline).await?;

        let mut checked = Vec::with_capacity(3 + byte_count);
        checked.extend_from_slice(&head);
        checked.push(len_byte[0]);
        checked.extend_from_slice(&body[..byte_count]);
        let expected = crc16(&checked);
        let actual = u16::from_le_bytes([body[byte_count], body[byte_count + 1]]);
        if expected != actual {
            return Err(ProtocolError::BadCrc { expected, actual });
        }

        Ok(words_from_bytes(&body[..byte_count]))
    }

    async fn read_tcp(
        &mut self,
        function: RegisterFunction,
        start: u16,
        count: u16,
        deadline: Duration,
    ) -> Result<Vec<u16>> {
        self.transport.drain().await;

        self.next_txn_id = self.next_txn_id.wrapping_add(1);
        let txn_id = self.next_txn_id;
        let request = encode_tcp_request(txn_id, self.unit_id, function, start, count);
        self.transport.write_all(&request, deadline).await?;

        let mut header = [0u8; 7];
        self.transport.read_exact(&mut header, deadline).await?;
        let rx_txn = u16::from_be_bytes([header[0], header[1]]);
        let rx_proto = u16::from_be_bytes([header[2], header[3]]);
        let rx_len = u16::from_be_bytes([header[4], header[5]]) as usize;
        if rx_txn != txn_id {
            return Err(ProtocolError::FrameMismatch(format!(
                "transaction id {rx_txn}, expected {txn_id}"
            )));
        }
        if rx_proto != 0 {
            return Err(ProtocolError::FrameMismatch(format!(
                "protocol id {rx_proto}, expected 0"
            )));
        }
        if header[6] != self.unit_id {
            return Err(ProtocolError::FrameMismatch(format!(
                "unit id {} in response, expected {}",
                header[6], self.unit_id
            )));
        }
        if rx_len < 2 {
            return Err(ProtocolError::Truncated {
                needed: 2,
                got: rx_len,
            });
        }

        // rx_len covers unit id + PDU; the unit id arrived with the header.
        let mut pdu = vec![0u8; rx_len - 1];
        self.transport.read_exact(&mut pdu, deadline).await?;

        if pdu[0] == function.function_code() | 0x80 {
            if pdu.len() < 2 {
                return Err(ProtocolError::Truncated { needed: 2, got: pdu.len() });
            }
            return Err(ProtocolError::Exception { code: pdu[1] });
        }
        if pdu[0] != function.function_code() {
            return Err(ProtocolError::FrameMismatch(format!(
                "function {:#04x} in response, expected {:#04x}",
                pdu[0],
                function.function_code()
            )));
        }

        let byte_count = pdu[1] as usize;
        if byte_count != count as usize * 2 || pdu.len() < 2 + byte_count {
            return Err(ProtocolError::FrameMismatch(format!(
                "byte count {} in response, expected {}",
                byte_count,
                count * 2
            )));
        }

        Ok(words_from_bytes(&pdu[2..2 + byte_count]))
    }
}

fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use helio_transport::TransportError;
    use std::collections::VecDeque;

    /// Scripted transport: every write is recorded, reads consume a
    /// pre-loaded byte queue.
    #[derive(Debug)]
    struct MockTransport {
        open: bool,
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl MockTransport {
        fn with_response(bytes: &[u8]) -> Self {
            Self {
                open: true,
                rx: bytes.iter().copied().collect(),
                tx: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ByteTransport for MockTransport {
        async fn connect(&mut self, _deadline: Duration) -> helio_transport::Result<()> {
            self.open = true;
            Ok(())
        }

        async fn read_exact(
            &mut self,
            buf: &mut [u8],
            deadline: Duration,
        ) -> helio_transport::Result<()> {
            if self.rx.len() < buf.len() {
                return Err(TransportError::Timeout(deadline));
            }
            for slot in buf.iter_mut() {
                *slot = self.rx.pop_front().unwrap();
            }
            Ok(())
        }

        async fn write_all(
            &mut self,
            buf: &[u8],
            _deadline: Duration,
        ) -> helio_transport::Result<()> {
            self.tx.extend_from_slice(buf);
            Ok(())
        }

        async fn drain(&mut self) {}

        async fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn describe(&self) -> String {
            "mock://".into()
        }
    }

    #[test]
    fn rtu_request_frame_matches_reference_vector() {
        // Slave 1, FC03, addr 0, count 2.
        let frame = encode_rtu_request(1, RegisterFunction::Holding, 0, 2);
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn crc_of_empty_input_is_init_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    fn rtu_response(unit: u8, fc: u8, words: &[u16]) -> Vec<u8> {
        let mut frame = vec![unit, fc, (words.len() * 2) as u8];
        for w in words {
            frame.extend_from_slice(&w.to_be_bytes());
        }
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    #[tokio::test]
    async fn rtu_read_decodes_registers() {
        let response = rtu_response(1, 0x03, &[0x1234, 0x5678]);
        let transport = MockTransport::with_response(&response);
        let mut client = ModbusClient::new(Box::new(transport), ModbusMode::Rtu, 1);
        let words = client
            .read_registers(RegisterFunction::Holding, 0, 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(words, vec![0x1234, 0x5678]);

        // Combined as a u32 this is the reference decode value.
        let combined = ((words[0] as u32) << 16) | words[1] as u32;
        assert_eq!(combined, 305419896);
    }

    #[tokio::test]
    async fn rtu_exception_is_surfaced_not_empty() {
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        let transport = MockTransport::with_response(&frame);
        let mut client = ModbusClient::new(Box::new(transport), ModbusMode::Rtu, 1);
        let err = client
            .read_registers(RegisterFunction::Holding, 0, 2, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Exception { code: 2 }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn rtu_bad_crc_is_rejected() {
        let mut response = rtu_response(1, 0x03, &[0x0001]);
        let last = response.len() - 1;
        response[last] ^= 0xFF;
        let transport = MockTransport::with_response(&response);
        let mut client = ModbusClient::new(Box::new(transport), ModbusMode::Rtu, 1);
        let err = client
            .read_registers(RegisterFunction::Holding, 0, 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BadCrc { .. }));
        assert!(err.is_transient());
    }

    fn tcp_response(txn: u16, unit: u8, fc: u8, words: &[u16]) -> Vec<u8> {
        let mut pdu = vec![fc, (words.len() * 2) as u8];
        for w in words {
            pdu.extend_from_slice(&w.to_be_bytes());
        }
        let mut frame = Vec::new();
        frame.extend_from_slice(&txn.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(&pdu);
        frame
    }

    #[tokio::test]
    async fn tcp_read_checks_transaction_id() {
        // First client transaction id is 1.
        let transport = MockTransport::with_response(&tcp_response(1, 1, 0x04, &[7]));
        let mut client = ModbusClient::new(Box::new(transport), ModbusMode::Tcp, 1);
        let words = client
            .read_registers(RegisterFunction::Input, 10, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(words, vec![7]);

        let transport = MockTransport::with_response(&tcp_response(99, 1, 0x04, &[7]));
        let mut client = ModbusClient::new(Box::new(transport), ModbusMode::Tcp, 1);
        let err = client
            .read_registers(RegisterFunction::Input, 10, 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameMismatch(_)));
    }

    #[tokio::test]
    async fn tcp_exception_is_surfaced() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&3u16.to_be_bytes());
        frame.push(1);
        frame.push(0x84);
        frame.push(0x0B);
        let transport = MockTransport::with_response(&frame);
        let mut client = ModbusClient::new(Box::new(transport), ModbusMode::Tcp, 1);
        let err = client
            .read_registers(RegisterFunction::Input, 0, 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Exception { code: 11 }));
    }
}
