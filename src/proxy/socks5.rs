//! SOCKS5 upstream handshake primitives
//!
//! The upstream speaks a hybrid dialect: a standard SOCKS5 greeting
//! and method selection, followed by an HTTP-style CONNECT line in
//! place of the binary CONNECT request. The upstream sends no reply
//! to the CONNECT line; the connection is usable as soon as the line
//! has been written.

use crate::common::Endpoint;
use crate::error::{Error, Result};

/// SOCKS protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication method
pub const AUTH_NONE: u8 = 0x00;

/// Client greeting offering exactly the no-auth method
pub const GREETING: [u8; 3] = [SOCKS5_VERSION, 0x01, AUTH_NONE];

/// Validate the two-byte method selection reply
///
/// Anything other than version 5 selecting no-auth is a handshake
/// failure.
pub fn check_method_reply(reply: &[u8; 2]) -> Result<()> {
    if reply[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "unexpected SOCKS version in method reply: {:#04x}",
            reply[0]
        )));
    }
    if reply[1] != AUTH_NONE {
        return Err(Error::Protocol(format!(
            "upstream refused no-auth method: {:#04x}",
            reply[1]
        )));
    }
    Ok(())
}

/// Build the CONNECT request line for a destination
pub fn connect_request(destination: &Endpoint) -> String {
    format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        destination, destination
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_bytes() {
        assert_eq!(GREETING, [0x05, 0x01, 0x00]);
    }

    #[test]
    fn test_method_reply_accepts_no_auth() {
        assert!(check_method_reply(&[0x05, 0x00]).is_ok());
    }

    #[test]
    fn test_method_reply_rejects_wrong_version() {
        let err = check_method_reply(&[0x04, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_method_reply_rejects_other_method() {
        // 0x01 here is GSSAPI, not the no-auth method we offered.
        let err = check_method_reply(&[0x05, 0x01]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_connect_request_line() {
        let dest = Endpoint::domain("example.com", 443);
        assert_eq!(
            connect_request(&dest),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_request_for_ip() {
        let dest = Endpoint::ip_port("93.184.216.34".parse().unwrap(), 80);
        assert_eq!(
            connect_request(&dest),
            "CONNECT 93.184.216.34:80 HTTP/1.1\r\nHost: 93.184.216.34:80\r\n\r\n"
        );
    }
}
