//! Minimal DNS wire codec
//!
//! Just enough of the message format to issue A queries and pull the
//! first A answer out of a response. Name-compression pointers are
//! honored when skipping names; nothing is ever followed or expanded.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Fixed DNS header length
const HEADER_LEN: usize = 12;

/// Maximum length of a queryable name
const MAX_NAME_LEN: usize = 253;

/// Maximum length of a single label
const MAX_LABEL_LEN: usize = 63;

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;

/// Flags word for a standard recursive query
const FLAGS_RD: u16 = 0x0100;

/// QR bit in the flags word
const FLAG_QR: u16 = 0x8000;

/// RCODE mask in the flags word
const RCODE_MASK: u16 = 0x000F;

/// Encode a recursive A query for `name` with the given transaction id
pub fn encode_query(id: u16, name: &str) -> Result<Vec<u8>> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return Err(Error::Dns("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Dns(format!("name too long: {} bytes", name.len())));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&FLAGS_RD.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    buf.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::Dns(format!("bad label in name: {}", name)));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);

    buf.extend_from_slice(&QTYPE_A.to_be_bytes());
    buf.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(buf)
}

/// Decode a response, returning the first IN/A answer
///
/// The answer TTL is deliberately not surfaced; cached records use a
/// fixed lifetime instead.
pub fn decode_response(buf: &[u8], id: u16) -> Result<Ipv4Addr> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Dns("response too short".into()));
    }

    let got_id = u16::from_be_bytes([buf[0], buf[1]]);
    if got_id != id {
        return Err(Error::Dns(format!(
            "transaction id mismatch: expected {}, got {}",
            id, got_id
        )));
    }

    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & FLAG_QR == 0 {
        return Err(Error::Dns("not a response".into()));
    }
    let rcode = flags & RCODE_MASK;
    if rcode != 0 {
        return Err(Error::Dns(format!("server returned rcode {}", rcode)));
    }

    let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;
    if ancount == 0 {
        return Err(Error::Dns("no answers".into()));
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(buf, pos)?;
        pos += 4; // QTYPE + QCLASS
        if pos > buf.len() {
            return Err(Error::Dns("truncated question".into()));
        }
    }

    for _ in 0..ancount {
        pos = skip_name(buf, pos)?;
        if pos + 10 > buf.len() {
            return Err(Error::Dns("truncated answer".into()));
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let rclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
        let rdlen = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > buf.len() {
            return Err(Error::Dns("truncated rdata".into()));
        }

        if rtype == QTYPE_A && rclass == QCLASS_IN && rdlen == 4 {
            return Ok(Ipv4Addr::new(
                buf[pos],
                buf[pos + 1],
                buf[pos + 2],
                buf[pos + 3],
            ));
        }
        pos += rdlen;
    }

    Err(Error::Dns("no A answer".into()))
}

/// Skip over an encoded name starting at `pos`
///
/// A compression pointer (top two bits set) is two bytes and always
/// ends the name.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = match buf.get(pos) {
            Some(len) => *len as usize,
            None => return Err(Error::Dns("truncated name".into())),
        };

        if len & 0xC0 == 0xC0 {
            if pos + 2 > buf.len() {
                return Err(Error::Dns("truncated name pointer".into()));
            }
            return Ok(pos + 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }

        pos += 1 + len;
        if pos > buf.len() {
            return Err(Error::Dns("truncated name".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query_layout() {
        let query = encode_query(0x1234, "example.com").unwrap();

        #[rustfmt::skip]
        let expected = [
            0x12, 0x34, // id
            0x01, 0x00, // flags: RD
            0x00, 0x01, // QDCOUNT
            0x00, 0x00, // ANCOUNT
            0x00, 0x00, // NSCOUNT
            0x00, 0x00, // ARCOUNT
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
            3, b'c', b'o', b'm',
            0,
            0x00, 0x01, // QTYPE A
            0x00, 0x01, // QCLASS IN
        ];
        assert_eq!(query, expected);
    }

    #[test]
    fn test_encode_query_normalizes_trailing_dot() {
        let dotted = encode_query(1, "example.com.").unwrap();
        let plain = encode_query(1, "example.com").unwrap();
        assert_eq!(dotted, plain);
    }

    #[test]
    fn test_encode_query_rejects_bad_names() {
        assert!(encode_query(1, "").is_err());
        assert!(encode_query(1, "a..b").is_err());
        let long_label = format!("{}.com", "x".repeat(64));
        assert!(encode_query(1, &long_label).is_err());
        let long_name = format!("{}.com", "x.".repeat(130));
        assert!(encode_query(1, &long_name).is_err());
    }

    /// A response echoing the question for `example.com` with one A answer
    fn sample_response(id: u16, flags: u16, answer: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        buf.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        // Question
        buf.extend_from_slice(b"\x07example\x03com\x00");
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        // Answer: pointer back to the question name
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes()); // TTL, ignored
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&answer);
        buf
    }

    #[test]
    fn test_decode_first_a_answer() {
        let response = sample_response(0xBEEF, 0x8180, [93, 184, 216, 34]);
        let addr = decode_response(&response, 0xBEEF).unwrap();
        assert_eq!(addr, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[test]
    fn test_decode_rejects_id_mismatch() {
        let response = sample_response(0xBEEF, 0x8180, [1, 2, 3, 4]);
        assert!(decode_response(&response, 0xCAFE).is_err());
    }

    #[test]
    fn test_decode_rejects_query_flags() {
        let response = sample_response(1, 0x0100, [1, 2, 3, 4]);
        assert!(decode_response(&response, 1).is_err());
    }

    #[test]
    fn test_decode_rejects_error_rcode() {
        // NXDOMAIN
        let response = sample_response(1, 0x8183, [1, 2, 3, 4]);
        assert!(decode_response(&response, 1).is_err());
    }

    #[test]
    fn test_decode_skips_non_a_records() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&0x8180u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes()); // CNAME then A
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(b"\x07example\x03com\x00");
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        // CNAME answer
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&5u16.to_be_bytes()); // TYPE CNAME
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&6u16.to_be_bytes());
        buf.extend_from_slice(b"\x03www\xC0\x0C");
        // A answer
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&[10, 11, 12, 13]);

        let addr = decode_response(&buf, 7).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 11, 12, 13));
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let response = sample_response(1, 0x8180, [1, 2, 3, 4]);
        assert!(decode_response(&response[..10], 1).is_err());
        assert!(decode_response(&response[..response.len() - 2], 1).is_err());
    }
}
