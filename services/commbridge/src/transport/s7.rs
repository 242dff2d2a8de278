//! Native async S7 client (ISO-on-TCP)
//!
//! Frame layout: TPKT (RFC 1006, 4 bytes) + COTP data header (3 bytes) + S7
//! PDU. Only data block access is implemented: byte ranges and single bits.
//! Requests larger than the negotiated PDU are split into chunks.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{S7Endpoint, S7Transport, DEFAULT_TIMEOUT};
use crate::error::{BridgeError, Result};
use crate::s7_address::MAX_BYTE_OFFSET;

const ISO_ID: u8 = 0x03;
const S7_ID: u8 = 0x32;
const TPKT_LEN: usize = 4;
const TPKT_ISO_LEN: usize = 7;

const ISO_CONN_REQ: u8 = 0xE0;
const ISO_CONN_OK: u8 = 0xD0;
const ISO_CR_LEN: usize = 22;
const ISO_PN_REQ_LEN: usize = 25;
const ISO_PN_RES_LEN: usize = 27;

/// PDU size asked for during negotiation
const PDU_LEN_REQ: u16 = 480;

const AREA_DB: u8 = 0x84;
const WL_BIT: u8 = 0x01;
const WL_BYTE: u8 = 0x02;
const TS_RES_BIT: u8 = 0x03;
const TS_RES_BYTE: u8 = 0x04;

const FN_READ: u8 = 0x04;
const FN_WRITE: u8 = 0x05;

const READ_REQ_LEN: usize = 31;
const WRITE_REQ_LEN: usize = 35;
/// Response header sizes inside the S7 PDU
const READ_RES_LEN: usize = 18;
const WRITE_RES_LEN: usize = 15;
/// Item return code position inside the S7 PDU
const RW_RES_OFFSET: usize = 14;

const RES_SUCCESS: u8 = 0xFF;
const RES_INVALID_ADDRESS: u8 = 0x05;
const RES_NOT_FOUND: u8 = 0x0A;

pub struct S7Client {
    stream: Option<TcpStream>,
    pdu_length: u16,
    timeout: Duration,
}

impl S7Client {
    pub fn new() -> Self {
        Self {
            stream: None,
            pdu_length: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Negotiated PDU size, 0 while disconnected
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn max_read_payload(&self) -> u32 {
        u32::from(self.pdu_length.saturating_sub(18)).max(1)
    }

    fn max_write_payload(&self) -> u32 {
        u32::from(self.pdu_length.saturating_sub(28)).max(1)
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.pdu_length = 0;
    }

    /// Send one telegram and read back one complete TPKT frame
    async fn exchange(&mut self, request: &[u8]) -> Result<BytesMut> {
        let limit = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BridgeError::disconnected("S7 client not connected"))?;

        let result = timeout(limit, async move {
            stream.write_all(request).await?;
            read_frame(stream).await
        })
        .await;

        match result {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => {
                warn!("S7 I/O failure, dropping connection: {}", e);
                self.drop_connection();
                Err(BridgeError::disconnected(e.to_string()))
            },
            Err(_) => {
                warn!("S7 request timed out after {:?}, dropping connection", limit);
                self.drop_connection();
                Err(BridgeError::disconnected(format!(
                    "S7 request timed out after {:?}",
                    limit
                )))
            },
        }
    }

    async fn handshake(&mut self, local_tsap: u16, remote_tsap: u16) -> Result<()> {
        let response = self.exchange(&connection_request(local_tsap, remote_tsap)).await?;
        if response.len() < ISO_CR_LEN || response[5] != ISO_CONN_OK {
            return Err(BridgeError::protocol("ISO connection refused by PLC"));
        }

        let response = self.exchange(&pdu_negotiation()).await?;
        if response.len() < ISO_PN_RES_LEN || response[7] != S7_ID || response[17] != 0x00 {
            return Err(BridgeError::protocol("S7 PDU negotiation failed"));
        }

        let pdu_length = u16::from_be_bytes([response[25], response[26]]);
        if pdu_length < 32 {
            return Err(BridgeError::protocol(format!(
                "PLC negotiated unusable PDU size {}",
                pdu_length
            )));
        }
        self.pdu_length = pdu_length;
        Ok(())
    }

    async fn write_area(&mut self, db: u16, address: u32, wordlen: u8, payload: &[u8]) -> Result<()> {
        let request = write_request(db, address, wordlen, payload);
        let response = self.exchange(&request).await?;
        check_item(&response, WRITE_RES_LEN)
    }
}

impl Default for S7Client {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<BytesMut> {
    let mut header = [0u8; TPKT_LEN];
    stream.read_exact(&mut header).await?;
    if header[0] != ISO_ID {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid TPKT header",
        ));
    }

    let total = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if total < TPKT_ISO_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid telegram length {}", total),
        ));
    }

    let mut frame = BytesMut::with_capacity(total);
    frame.extend_from_slice(&header);
    frame.resize(total, 0);
    stream.read_exact(&mut frame[TPKT_LEN..]).await?;
    Ok(frame)
}

fn put_tpkt_cotp(buf: &mut BytesMut) {
    buf.put_u8(ISO_ID);
    buf.put_u8(0x00);
    // Telegram length, patched once the frame is complete
    buf.put_u16(0);
    // COTP data header: length, DT, EOT
    buf.put_slice(&[0x02, 0xF0, 0x80]);
}

fn patch_length(buf: &mut BytesMut) {
    let len = buf.len() as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn connection_request(local_tsap: u16, remote_tsap: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ISO_CR_LEN);
    buf.put_u8(ISO_ID);
    buf.put_u8(0x00);
    buf.put_u16(ISO_CR_LEN as u16);
    buf.put_u8(0x11);
    buf.put_u8(ISO_CONN_REQ);
    // Dst ref, src ref, class
    buf.put_slice(&[0x00, 0x00, 0x00, 0x01, 0x00]);
    // TPDU size parameter
    buf.put_slice(&[0xC0, 0x01, 0x0A]);
    buf.put_slice(&[0xC1, 0x02]);
    buf.put_u16(local_tsap);
    buf.put_slice(&[0xC2, 0x02]);
    buf.put_u16(remote_tsap);
    buf
}

fn pdu_negotiation() -> BytesMut {
    let mut buf = BytesMut::with_capacity(ISO_PN_REQ_LEN);
    put_tpkt_cotp(&mut buf);
    buf.put_slice(&[S7_ID, 0x01, 0x00, 0x00, 0x04, 0x00, 0x00, 0x08, 0x00]);
    buf.put_slice(&[0x00, 0xF0, 0x00, 0x00, 0x01, 0x00, 0x01]);
    buf.put_u16(PDU_LEN_REQ);
    patch_length(&mut buf);
    buf
}

/// S7 header + single-item parameter block shared by read and write jobs
fn put_item_header(
    buf: &mut BytesMut,
    function: u8,
    data_len: u16,
    wordlen: u8,
    count: u16,
    db: u16,
    bit_address: u32,
) {
    buf.put_u8(S7_ID);
    // Job, redundancy id, PDU reference
    buf.put_slice(&[0x01, 0x00, 0x00, 0x05, 0x00]);
    // Parameter length
    buf.put_u16(0x000E);
    buf.put_u16(data_len);
    buf.put_u8(function);
    // One item, variable spec, address length, syntax id ANY
    buf.put_slice(&[0x01, 0x12, 0x0A, 0x10]);
    buf.put_u8(wordlen);
    buf.put_u16(count);
    buf.put_u16(db);
    buf.put_u8(AREA_DB);
    buf.put_u8((bit_address >> 16) as u8);
    buf.put_u8((bit_address >> 8) as u8);
    buf.put_u8(bit_address as u8);
}

fn read_request(db: u16, byte_start: u32, count: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(READ_REQ_LEN);
    put_tpkt_cotp(&mut buf);
    put_item_header(&mut buf, FN_READ, 0, WL_BYTE, count, db, byte_start << 3);
    patch_length(&mut buf);
    buf
}

/// `address` is a byte offset for `WL_BYTE` and a bit offset for `WL_BIT`
fn write_request(db: u16, address: u32, wordlen: u8, payload: &[u8]) -> BytesMut {
    let len = payload.len() as u16;
    let (bit_address, transport, payload_bits) = if wordlen == WL_BIT {
        (address, TS_RES_BIT, 1u16)
    } else {
        (address << 3, TS_RES_BYTE, len << 3)
    };

    let mut buf = BytesMut::with_capacity(WRITE_REQ_LEN + payload.len());
    put_tpkt_cotp(&mut buf);
    put_item_header(&mut buf, FN_WRITE, len + 4, wordlen, len, db, bit_address);
    buf.put_u8(0x00);
    buf.put_u8(transport);
    buf.put_u16(payload_bits);
    buf.put_slice(payload);
    patch_length(&mut buf);
    buf
}

/// Validate the item return code of a read/write acknowledgement
fn check_item(frame: &[u8], min_len: usize) -> Result<()> {
    if frame.len() < TPKT_ISO_LEN + min_len {
        return Err(BridgeError::protocol(format!(
            "S7 response too short ({} bytes)",
            frame.len()
        )));
    }
    match frame[TPKT_ISO_LEN + RW_RES_OFFSET] {
        RES_SUCCESS => Ok(()),
        RES_INVALID_ADDRESS => Err(BridgeError::protocol(
            "S7 invalid address (out of DB bounds or optimized block)",
        )),
        RES_NOT_FOUND => Err(BridgeError::protocol("S7 object not found")),
        code => Err(BridgeError::protocol(format!(
            "S7 item error 0x{:02X}",
            code
        ))),
    }
}

fn check_offset(start: u32, len: u32) -> Result<()> {
    match start.checked_add(len) {
        Some(end) if end <= MAX_BYTE_OFFSET + 1 => Ok(()),
        _ => Err(BridgeError::out_of_range(format!(
            "DB range {}+{} exceeds the S7 address space",
            start, len
        ))),
    }
}

#[async_trait]
impl S7Transport for S7Client {
    async fn connect(&mut self, endpoint: &S7Endpoint) -> Result<()> {
        self.drop_connection();
        self.timeout = endpoint.timeout;

        let target = format!("{}:{}", endpoint.host, endpoint.port);
        debug!("Connecting S7 to {}", endpoint);
        let stream = timeout(endpoint.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                BridgeError::disconnected(format!(
                    "connect to {} timed out after {:?}",
                    target, endpoint.timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let (local_tsap, remote_tsap) = endpoint.cpu_type.tsaps(endpoint.rack, endpoint.slot);
        if let Err(e) = self.handshake(local_tsap, remote_tsap).await {
            self.drop_connection();
            return Err(e);
        }

        info!("S7 connected to {} (PDU {})", endpoint, self.pdu_length);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // Peer may already be gone
            let _ = stream.shutdown().await;
        }
        self.pdu_length = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn read_db_bytes(&mut self, db: u16, start: u32, len: u32) -> Result<Vec<u8>> {
        check_offset(start, len)?;
        let mut data = Vec::with_capacity(len as usize);
        let mut offset = 0u32;

        while offset < len {
            let chunk = (len - offset).min(self.max_read_payload());
            let request = read_request(db, start + offset, chunk as u16);
            let response = self.exchange(&request).await?;
            check_item(&response, READ_RES_LEN)?;

            let payload_start = TPKT_ISO_LEN + READ_RES_LEN;
            let payload_end = payload_start + chunk as usize;
            let payload = response.get(payload_start..payload_end).ok_or_else(|| {
                BridgeError::protocol(format!(
                    "S7 read of DB{} returned {} bytes, expected {}",
                    db,
                    response.len().saturating_sub(payload_start),
                    chunk
                ))
            })?;
            data.extend_from_slice(payload);
            offset += chunk;
        }

        Ok(data)
    }

    async fn write_db_bytes(&mut self, db: u16, start: u32, bytes: &[u8]) -> Result<()> {
        check_offset(start, bytes.len() as u32)?;
        let max = self.max_write_payload() as usize;
        let mut offset = 0usize;

        for chunk in bytes.chunks(max) {
            self.write_area(db, start + offset as u32, WL_BYTE, chunk)
                .await?;
            offset += chunk.len();
        }
        Ok(())
    }

    async fn write_db_bit(&mut self, db: u16, byte: u32, bit: u8, value: bool) -> Result<()> {
        if bit > 7 {
            return Err(BridgeError::out_of_range(format!("bit index {}", bit)));
        }
        check_offset(byte, 1)?;
        self.write_area(db, byte * 8 + u32::from(bit), WL_BIT, &[u8::from(value)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_request_layout() {
        let frame = connection_request(0x0100, 0x0102);
        assert_eq!(frame.len(), ISO_CR_LEN);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x16]);
        assert_eq!(frame[5], ISO_CONN_REQ);
        assert_eq!(&frame[16..18], &[0x01, 0x00]);
        assert_eq!(&frame[20..22], &[0x01, 0x02]);
    }

    #[test]
    fn test_pdu_negotiation_layout() {
        let frame = pdu_negotiation();
        assert_eq!(frame.len(), ISO_PN_REQ_LEN);
        assert_eq!(&frame[2..4], &[0x00, 0x19]);
        assert_eq!(&frame[23..25], &PDU_LEN_REQ.to_be_bytes());
    }

    #[test]
    fn test_read_request_layout() {
        let frame = read_request(7, 10, 4);
        assert_eq!(frame.len(), READ_REQ_LEN);
        assert_eq!(&frame[2..4], &[0x00, 0x1F]);
        assert_eq!(frame[17], FN_READ);
        assert_eq!(frame[22], WL_BYTE);
        assert_eq!(&frame[23..25], &[0x00, 0x04]);
        assert_eq!(&frame[25..27], &[0x00, 0x07]);
        assert_eq!(frame[27], AREA_DB);
        // 10 bytes -> bit address 80
        assert_eq!(&frame[28..31], &[0x00, 0x00, 0x50]);
    }

    #[test]
    fn test_write_request_layout() {
        let frame = write_request(1, 2, WL_BYTE, &[0xAA, 0xBB]);
        assert_eq!(frame.len(), WRITE_REQ_LEN + 2);
        assert_eq!(&frame[2..4], &(37u16).to_be_bytes());
        assert_eq!(&frame[15..17], &[0x00, 0x06]);
        assert_eq!(frame[17], FN_WRITE);
        assert_eq!(frame[32], TS_RES_BYTE);
        assert_eq!(&frame[33..35], &[0x00, 0x10]);
        assert_eq!(&frame[35..], &[0xAA, 0xBB]);

        let frame = write_request(1, 3 * 8 + 5, WL_BIT, &[1]);
        assert_eq!(frame[22], WL_BIT);
        assert_eq!(&frame[28..31], &[0x00, 0x00, 29]);
        assert_eq!(frame[32], TS_RES_BIT);
        assert_eq!(&frame[33..35], &[0x00, 0x01]);
    }

    #[test]
    fn test_item_return_codes() {
        let mut frame = vec![0u8; TPKT_ISO_LEN + WRITE_RES_LEN];
        frame[TPKT_ISO_LEN + RW_RES_OFFSET] = RES_SUCCESS;
        assert!(check_item(&frame, WRITE_RES_LEN).is_ok());

        frame[TPKT_ISO_LEN + RW_RES_OFFSET] = RES_NOT_FOUND;
        assert!(matches!(
            check_item(&frame, WRITE_RES_LEN),
            Err(BridgeError::Protocol(_))
        ));

        assert!(check_item(&frame[..10], WRITE_RES_LEN).is_err());
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut client = S7Client::new();
        assert!(!client.is_connected());
        let err = client.read_db_bytes(1, 0, 4).await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
