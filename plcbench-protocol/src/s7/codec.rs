//! ISO-on-TCP framing (TPKT + COTP) and the S7 communication PDUs the adapter needs:
//! connection setup, setup-communication, and single-item read/write of a data block.

use bytes::{BufMut, BytesMut};
use plcbench_common::{BenchError, Result};

pub const TPKT_HEADER_LEN: usize = 4;
const TPKT_VERSION: u8 = 0x03;

const COTP_CONNECT_REQUEST: u8 = 0xE0;
const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA_HEADER: [u8; 3] = [0x02, 0xF0, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK: u8 = 0x02;
const ROSCTR_ACK_DATA: u8 = 0x03;
const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;

const FN_SETUP_COMMUNICATION: u8 = 0xF0;
const FN_READ_VAR: u8 = 0x04;
const FN_WRITE_VAR: u8 = 0x05;

const AREA_DATA_BLOCK: u8 = 0x84;
const RETURN_SUCCESS: u8 = 0xFF;

/// PDU size requested during setup; controllers may negotiate it down
pub const REQUESTED_PDU_LENGTH: u16 = 480;

/// Header bytes a write-var request spends around its payload
pub const WRITE_OVERHEAD: usize = 35;

/// Header bytes a read-var acknowledgement spends around its payload
pub const READ_OVERHEAD: usize = 18;

/// Item granularity used in request addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSize {
    Bit,
    Byte,
}

impl TransportSize {
    fn item_code(self) -> u8 {
        match self {
            TransportSize::Bit => 0x01,
            TransportSize::Byte => 0x02,
        }
    }

    fn data_code(self) -> u8 {
        match self {
            TransportSize::Bit => 0x03,
            TransportSize::Byte => 0x04,
        }
    }
}

/// Location of a value in a data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbAddress {
    pub db: u16,
    pub byte_offset: u32,
    pub bit: u8,
}

impl DbAddress {
    pub fn byte(db: u16, byte_offset: u32) -> Self {
        Self { db, byte_offset, bit: 0 }
    }

    pub fn bit(db: u16, byte_offset: u32, bit: u8) -> Self {
        Self { db, byte_offset, bit }
    }

    fn bit_address(&self) -> u32 {
        self.byte_offset * 8 + u32::from(self.bit)
    }
}

fn protocol_error(message: impl Into<String>) -> BenchError {
    BenchError::operation("s7", message)
}

fn put_tpkt(buf: &mut BytesMut, total_len: usize) {
    buf.put_u8(TPKT_VERSION);
    buf.put_u8(0x00);
    buf.put_u16(total_len as u16);
}

/// COTP connection request addressed to the CPU at `rack`/`slot`
pub fn connection_request(rack: u16, slot: u16) -> BytesMut {
    let remote_tsap = (rack * 0x20 + slot) as u8;
    let cotp: [u8; 18] = [
        0x11,
        COTP_CONNECT_REQUEST,
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00,       // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // calling TSAP
        0xC2, 0x02, 0x01, remote_tsap, // called TSAP (PG connection)
    ];
    let mut buf = BytesMut::with_capacity(TPKT_HEADER_LEN + cotp.len());
    put_tpkt(&mut buf, TPKT_HEADER_LEN + cotp.len());
    buf.put_slice(&cotp);
    buf
}

pub fn check_connection_confirm(frame: &[u8]) -> Result<()> {
    match frame.get(TPKT_HEADER_LEN + 1) {
        Some(&COTP_CONNECT_CONFIRM) => Ok(()),
        Some(other) => Err(protocol_error(format!(
            "expected COTP connection confirm, got PDU type 0x{:02X}",
            other
        ))),
        None => Err(protocol_error("truncated COTP connection confirm")),
    }
}

/// Total frame length announced by a TPKT header
pub fn frame_length(header: &[u8; TPKT_HEADER_LEN]) -> Result<usize> {
    if header[0] != TPKT_VERSION {
        return Err(protocol_error(format!("bad TPKT version 0x{:02X}", header[0])));
    }
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if len < TPKT_HEADER_LEN + 3 {
        return Err(protocol_error(format!("TPKT length {} too short", len)));
    }
    Ok(len)
}

fn job_frame(pdu_ref: u16, params: &[u8], data: &[u8]) -> BytesMut {
    let total = TPKT_HEADER_LEN + COTP_DATA_HEADER.len() + JOB_HEADER_LEN + params.len() + data.len();
    let mut buf = BytesMut::with_capacity(total);
    put_tpkt(&mut buf, total);
    buf.put_slice(&COTP_DATA_HEADER);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(ROSCTR_JOB);
    buf.put_u16(0);
    buf.put_u16(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    buf.put_slice(params);
    buf.put_slice(data);
    buf
}

pub fn setup_communication(pdu_ref: u16, pdu_length: u16) -> BytesMut {
    let mut params = BytesMut::with_capacity(8);
    params.put_u8(FN_SETUP_COMMUNICATION);
    params.put_u8(0x00);
    params.put_u16(1); // max AmQ calling
    params.put_u16(1); // max AmQ called
    params.put_u16(pdu_length);
    job_frame(pdu_ref, &params, &[])
}

fn put_item(params: &mut BytesMut, address: DbAddress, size: TransportSize, count: u16) {
    let bit_address = address.bit_address();
    params.put_u8(0x12);
    params.put_u8(0x0A);
    params.put_u8(0x10);
    params.put_u8(size.item_code());
    params.put_u16(count);
    params.put_u16(address.db);
    params.put_u8(AREA_DATA_BLOCK);
    params.put_u8((bit_address >> 16) as u8);
    params.put_u8((bit_address >> 8) as u8);
    params.put_u8(bit_address as u8);
}

/// Write-var job for one item. Bit writes carry exactly one byte of payload.
pub fn write_request(pdu_ref: u16, address: DbAddress, size: TransportSize, payload: &[u8]) -> BytesMut {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_WRITE_VAR);
    params.put_u8(1);
    put_item(&mut params, address, size, payload.len() as u16);

    let mut data = BytesMut::with_capacity(4 + payload.len());
    data.put_u8(0x00);
    data.put_u8(size.data_code());
    let length = match size {
        TransportSize::Bit => payload.len() as u16,
        TransportSize::Byte => (payload.len() * 8) as u16,
    };
    data.put_u16(length);
    data.put_slice(payload);
    job_frame(pdu_ref, &params, &data)
}

pub fn read_request(pdu_ref: u16, address: DbAddress, size: TransportSize, count: u16) -> BytesMut {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_READ_VAR);
    params.put_u8(1);
    put_item(&mut params, address, size, count);
    job_frame(pdu_ref, &params, &[])
}

/// A parsed acknowledgement PDU
#[derive(Debug)]
pub struct Ack<'a> {
    pub pdu_ref: u16,
    pub params: &'a [u8],
    pub data: &'a [u8],
}

/// Strip TPKT and COTP headers from a data frame
pub fn s7_payload(frame: &[u8]) -> Result<&[u8]> {
    let li = *frame
        .get(TPKT_HEADER_LEN)
        .ok_or_else(|| protocol_error("truncated COTP header"))? as usize;
    frame
        .get(TPKT_HEADER_LEN + 1 + li..)
        .ok_or_else(|| protocol_error("truncated COTP header"))
}

pub fn parse_ack(pdu: &[u8]) -> Result<Ack<'_>> {
    if pdu.len() < JOB_HEADER_LEN || pdu[0] != S7_PROTOCOL_ID {
        return Err(protocol_error("not an S7 PDU"));
    }
    let rosctr = pdu[1];
    if rosctr != ROSCTR_ACK && rosctr != ROSCTR_ACK_DATA {
        return Err(protocol_error(format!("unexpected ROSCTR 0x{:02X}", rosctr)));
    }
    if pdu.len() < ACK_HEADER_LEN {
        return Err(protocol_error("truncated S7 ack header"));
    }
    let pdu_ref = u16::from_be_bytes([pdu[4], pdu[5]]);
    let param_len = usize::from(u16::from_be_bytes([pdu[6], pdu[7]]));
    let data_len = usize::from(u16::from_be_bytes([pdu[8], pdu[9]]));
    let (error_class, error_code) = (pdu[10], pdu[11]);
    if error_class != 0 || error_code != 0 {
        return Err(protocol_error(format!(
            "controller rejected job: error class 0x{:02X} code 0x{:02X}",
            error_class, error_code
        )));
    }
    let params_end = ACK_HEADER_LEN + param_len;
    let data_end = params_end + data_len;
    if pdu.len() < data_end {
        return Err(protocol_error("S7 ack shorter than announced"));
    }
    Ok(Ack {
        pdu_ref,
        params: &pdu[ACK_HEADER_LEN..params_end],
        data: &pdu[params_end..data_end],
    })
}

/// PDU reference of any S7 PDU, used to discard stale responses
pub fn pdu_reference(pdu: &[u8]) -> Option<u16> {
    if pdu.len() >= 6 && pdu[0] == S7_PROTOCOL_ID {
        Some(u16::from_be_bytes([pdu[4], pdu[5]]))
    } else {
        None
    }
}

/// Negotiated PDU length from a setup-communication response
pub fn parse_setup_response(pdu: &[u8]) -> Result<u16> {
    let ack = parse_ack(pdu)?;
    if ack.params.len() < 8 || ack.params[0] != FN_SETUP_COMMUNICATION {
        return Err(protocol_error("malformed setup communication response"));
    }
    Ok(u16::from_be_bytes([ack.params[6], ack.params[7]]))
}

pub fn parse_write_response(pdu: &[u8]) -> Result<()> {
    let ack = parse_ack(pdu)?;
    if ack.params.first() != Some(&FN_WRITE_VAR) {
        return Err(protocol_error("response is not a write-var acknowledgement"));
    }
    match ack.data.first() {
        Some(&RETURN_SUCCESS) => Ok(()),
        Some(&code) => Err(protocol_error(format!("write rejected: {}", return_code_text(code)))),
        None => Err(protocol_error("write response carried no item result")),
    }
}

/// Payload bytes of a single-item read response
pub fn parse_read_response(pdu: &[u8]) -> Result<Vec<u8>> {
    let ack = parse_ack(pdu)?;
    if ack.params.first() != Some(&FN_READ_VAR) {
        return Err(protocol_error("response is not a read-var acknowledgement"));
    }
    let data = ack.data;
    let code = *data.first().ok_or_else(|| protocol_error("read response carried no item"))?;
    if code != RETURN_SUCCESS {
        return Err(protocol_error(format!("read rejected: {}", return_code_text(code))));
    }
    if data.len() < 4 {
        return Err(protocol_error("truncated read item header"));
    }
    let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
    let byte_len = match data[1] {
        // bit and byte/word transports announce their length in bits
        0x03 | 0x04 | 0x05 => length.div_ceil(8),
        _ => length,
    };
    data.get(4..4 + byte_len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| protocol_error("read item shorter than announced"))
}

fn return_code_text(code: u8) -> String {
    let text = match code {
        0x01 => "hardware fault",
        0x03 => "access denied",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown return code",
    };
    format!("{} (0x{:02X})", text, code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_data(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut pdu = vec![S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0, 0];
        pdu.extend_from_slice(&pdu_ref.to_be_bytes());
        pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&[0, 0]);
        pdu.extend_from_slice(params);
        pdu.extend_from_slice(data);
        pdu
    }

    #[test]
    fn test_connection_request_bytes() {
        let frame = connection_request(0, 1);
        assert_eq!(
            frame.as_ref(),
            &[
                0x03, 0x00, 0x00, 0x16, 0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01,
                0x0A, 0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x01
            ]
        );
        assert_eq!(connection_request(0, 2)[21], 0x02);
        assert_eq!(connection_request(1, 3)[21], 0x23);
    }

    #[test]
    fn test_setup_communication_bytes() {
        let frame = setup_communication(0x0100, REQUESTED_PDU_LENGTH);
        assert_eq!(frame.len(), 25);
        assert_eq!(
            frame.as_ref(),
            &[
                0x03, 0x00, 0x00, 0x19, 0x02, 0xF0, 0x80, 0x32, 0x01, 0x00, 0x00, 0x01, 0x00,
                0x00, 0x08, 0x00, 0x00, 0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0
            ]
        );
    }

    #[test]
    fn test_write_bit_request() {
        let frame = write_request(2, DbAddress::bit(7, 0, 3), TransportSize::Bit, &[1]);
        assert_eq!(frame.len(), 36);
        let pdu = &frame[7..];
        // parameter block: function, item count, item spec
        assert_eq!(
            &pdu[10..24],
            &[0x05, 0x01, 0x12, 0x0A, 0x10, 0x01, 0x00, 0x01, 0x00, 0x07, 0x84, 0x00, 0x00, 0x03]
        );
        // data block: reserved, bit transport, length 1 bit, value
        assert_eq!(&pdu[24..], &[0x00, 0x03, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_write_int16_request_uses_big_endian_and_bit_length() {
        let value: i16 = -2;
        let frame = write_request(3, DbAddress::byte(7, 2), TransportSize::Byte, &value.to_be_bytes());
        let pdu = &frame[7..];
        // start address 2 * 8 = 16 bits
        assert_eq!(&pdu[21..24], &[0x00, 0x00, 0x10]);
        assert_eq!(&pdu[24..], &[0x00, 0x04, 0x00, 0x10, 0xFF, 0xFE]);
    }

    #[test]
    fn test_read_request_has_no_data() {
        let frame = read_request(4, DbAddress::byte(7, 4), TransportSize::Byte, 4);
        let pdu = &frame[7..];
        assert_eq!(u16::from_be_bytes([pdu[8], pdu[9]]), 0);
        assert_eq!(pdu[10], FN_READ_VAR);
        assert_eq!(u16::from_be_bytes([pdu[16], pdu[17]]), 4);
    }

    #[test]
    fn test_parse_setup_response() {
        let pdu = ack_data(1, &[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0], &[]);
        assert_eq!(parse_setup_response(&pdu).unwrap(), 240);
    }

    #[test]
    fn test_parse_write_response() {
        assert!(parse_write_response(&ack_data(5, &[0x05, 0x01], &[0xFF])).is_ok());
        let err = parse_write_response(&ack_data(5, &[0x05, 0x01], &[0x05])).unwrap_err();
        assert!(err.to_string().contains("address out of range"));
    }

    #[test]
    fn test_parse_read_response() {
        let pdu = ack_data(6, &[0x04, 0x01], &[0xFF, 0x04, 0x00, 0x20, 0x00, 0x00, 0x01, 0x2C]);
        assert_eq!(parse_read_response(&pdu).unwrap(), vec![0x00, 0x00, 0x01, 0x2C]);

        let bit = ack_data(6, &[0x04, 0x01], &[0xFF, 0x03, 0x00, 0x01, 0x01]);
        assert_eq!(parse_read_response(&bit).unwrap(), vec![0x01]);

        let missing = ack_data(6, &[0x04, 0x01], &[0x0A, 0x00, 0x00, 0x00]);
        assert!(parse_read_response(&missing).is_err());
    }

    #[test]
    fn test_job_level_error_rejected() {
        let mut pdu = ack_data(7, &[0x05, 0x01], &[0xFF]);
        pdu[10] = 0x81;
        pdu[11] = 0x04;
        assert!(parse_write_response(&pdu).is_err());
    }

    #[test]
    fn test_frame_helpers() {
        assert_eq!(frame_length(&[0x03, 0x00, 0x00, 0x16]).unwrap(), 22);
        assert!(frame_length(&[0x04, 0x00, 0x00, 0x16]).is_err());

        let frame = write_request(9, DbAddress::byte(1, 0), TransportSize::Byte, &[0xAA]);
        let pdu = s7_payload(&frame).unwrap();
        assert_eq!(pdu_reference(pdu), Some(9));

        let mut confirm = connection_request(0, 1).to_vec();
        confirm[5] = COTP_CONNECT_CONFIRM;
        assert!(check_connection_confirm(&confirm).is_ok());
        assert!(check_connection_confirm(&connection_request(0, 1)).is_err());
    }
}
