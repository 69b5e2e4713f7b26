//! Modbus framing for function 0x03 (read holding registers)
//!
//! RTU: `slave | pdu | crc_lo crc_hi`
//! TCP: `tid(2) | proto(2)=0 | len(2) | unit | pdu`, where `len` counts the
//! unit byte plus the PDU.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::error::TransportError;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const MBAP_HEADER_LEN: usize = 7;

const RTU_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    RTU_CRC.checksum(data)
}

pub fn read_request_pdu(start: u16, count: u16) -> [u8; 5] {
    let [start_hi, start_lo] = start.to_be_bytes();
    let [count_hi, count_lo] = count.to_be_bytes();
    [
        FC_READ_HOLDING_REGISTERS,
        start_hi,
        start_lo,
        count_hi,
        count_lo,
    ]
}

/// Build the response PDU a device would send for `values`
pub fn read_response_pdu(values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + values.len() * 2);
    pdu.push(FC_READ_HOLDING_REGISTERS);
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

pub fn encode_rtu(slave_id: u8, pdu: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(slave_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.freeze()
}

/// Verify the trailing CRC of a complete RTU frame
pub fn check_rtu_crc(frame: &[u8]) -> Result<(), TransportError> {
    if frame.len() < 4 {
        return Err(TransportError::Codec(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let body = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body], frame[body + 1]]);
    let calculated = crc16(&frame[..body]);
    if received != calculated {
        return Err(TransportError::Codec(format!(
            "CRC mismatch: calculated 0x{:04X}, received 0x{:04X}",
            calculated, received
        )));
    }
    Ok(())
}

pub fn encode_mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self, TransportError> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(TransportError::Codec(format!(
                "unexpected MBAP protocol id {}",
                header.protocol_id
            )));
        }
        // unit byte + at least a function code and one more byte
        if !(3..=254).contains(&header.length) {
            return Err(TransportError::Codec(format!(
                "invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

/// Decode a 0x03 response PDU (starting at the function code)
pub fn decode_read_response(pdu: &[u8], expected: u16) -> Result<Vec<u16>, TransportError> {
    let function = *pdu
        .first()
        .ok_or_else(|| TransportError::Codec("empty PDU".to_string()))?;

    if function == FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(TransportError::Exception { code });
    }
    if function != FC_READ_HOLDING_REGISTERS {
        return Err(TransportError::Codec(format!(
            "unexpected function code 0x{:02X}",
            function
        )));
    }

    let byte_count = usize::from(pdu.get(1).copied().unwrap_or(0));
    let expected_bytes = usize::from(expected) * 2;
    if byte_count != expected_bytes || pdu.len() != 2 + byte_count {
        return Err(TransportError::Codec(format!(
            "expected {} data bytes, got byte count {} in {} byte PDU",
            expected_bytes,
            byte_count,
            pdu.len()
        )));
    }

    Ok(pdu[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_rtu_request_matches_reference_frame() {
        // slave 1, read 2 registers at 0x0000
        let frame = encode_rtu(0x01, &read_request_pdu(0x0000, 0x0002));
        assert_eq!(
            frame.as_ref(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );
        assert!(check_rtu_crc(&frame).is_ok());
    }

    #[test]
    fn test_corrupted_crc_is_codec_error() {
        let mut frame = encode_rtu(0x11, &read_response_pdu(&[0x1234])).to_vec();
        frame[3] ^= 0xFF;
        assert!(matches!(
            check_rtu_crc(&frame),
            Err(TransportError::Codec(_))
        ));
    }

    #[test]
    fn test_decode_values_and_exception() {
        let pdu = read_response_pdu(&[0x0102, 0xFFFF]);
        assert_eq!(decode_read_response(&pdu, 2).unwrap(), vec![0x0102, 0xFFFF]);

        assert!(matches!(
            decode_read_response(&pdu, 3),
            Err(TransportError::Codec(_))
        ));
        assert_eq!(
            decode_read_response(&[0x83, 0x02], 1),
            Err(TransportError::Exception { code: 0x02 })
        );
    }

    #[test]
    fn test_mbap_header_roundtrip_fields() {
        let frame = encode_mbap(0x0A0B, 7, &read_request_pdu(100, 4));
        let header: [u8; MBAP_HEADER_LEN] = frame[..MBAP_HEADER_LEN].try_into().unwrap();
        let header = MbapHeader::decode(&header).unwrap();

        assert_eq!(header.transaction_id, 0x0A0B);
        assert_eq!(header.unit_id, 7);
        assert_eq!(header.pdu_len(), 5);
        assert_eq!(frame.len(), MBAP_HEADER_LEN + header.pdu_len());
    }

    #[test]
    fn test_mbap_rejects_foreign_protocol() {
        let bytes = [0, 1, 0, 9, 0, 6, 1];
        assert!(MbapHeader::decode(&bytes).is_err());
    }
}
