//! Typed arguments decoded from command payloads.

use bytes::Bytes;

use crate::error::{MilterError, Result};
use crate::protocol::split_nul;

/// Address family of the SMTP client in a CONNECT command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// `U`: no address information.
    Unknown,
    /// `L`: local (unix) socket.
    Unix,
    /// `4`: IPv4.
    Inet,
    /// `6`: IPv6.
    Inet6,
}

impl Family {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            b'U' => Some(Family::Unknown),
            b'L' => Some(Family::Unix),
            b'4' => Some(Family::Inet),
            b'6' => Some(Family::Inet6),
            _ => None,
        }
    }
}

/// CONNECT: `hostname\0 family [port(u16 BE) address\0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Reverse hostname of the SMTP client.
    pub hostname: Bytes,
    /// Address family.
    pub family: Family,
    /// Client port, 0 when the family is unknown.
    pub port: u16,
    /// Client address or socket path.
    pub address: Option<Bytes>,
}

impl Connect {
    /// Decode a CONNECT body (command byte stripped).
    pub fn decode(body: &[u8]) -> Result<Self> {
        let nul = body
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| malformed("CONNECT", "hostname is not terminated"))?;
        let hostname = Bytes::copy_from_slice(&body[..nul]);
        let rest = &body[nul + 1..];

        let code = *rest
            .first()
            .ok_or_else(|| malformed("CONNECT", "missing address family"))?;
        let family = Family::from_code(code).ok_or_else(|| {
            malformed("CONNECT", &format!("unknown address family {:?}", code as char))
        })?;

        if family == Family::Unknown {
            return Ok(Self {
                hostname,
                family,
                port: 0,
                address: None,
            });
        }

        if rest.len() < 3 {
            return Err(malformed("CONNECT", "missing port"));
        }
        let port = u16::from_be_bytes([rest[1], rest[2]]);
        let address = &rest[3..];
        let address = address.strip_suffix(b"\0").unwrap_or(address);

        Ok(Self {
            hostname,
            family,
            port,
            address: Some(Bytes::copy_from_slice(address)),
        })
    }
}

/// MAIL and RCPT: an address followed by optional ESMTP arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// The envelope address, usually `<...>` qualified.
    pub address: Bytes,
    /// ESMTP arguments such as `SIZE=1024`.
    pub args: Vec<Bytes>,
}

impl Envelope {
    /// Decode a MAIL or RCPT body (command byte stripped).
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut fields = split_nul(body).into_iter();
        let address = fields
            .next()
            .ok_or_else(|| malformed("MAIL/RCPT", "missing address"))?;
        Ok(Self {
            address,
            args: fields.collect(),
        })
    }
}

/// HEADER: `name\0value\0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header field name.
    pub name: Bytes,
    /// Header field value (may be empty).
    pub value: Bytes,
}

impl Header {
    /// Decode a HEADER body (command byte stripped).
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut fields = split_nul(body).into_iter();
        let name = fields
            .next()
            .ok_or_else(|| malformed("HEADER", "missing name"))?;
        Ok(Self {
            name,
            value: fields.next().unwrap_or_default(),
        })
    }
}

/// HELO: `heloname\0`.
pub fn decode_helo(body: &[u8]) -> Result<Bytes> {
    split_nul(body)
        .into_iter()
        .next()
        .ok_or_else(|| malformed("HELO", "missing helo name"))
}

/// UNKNOWN: the raw SMTP command line, NUL stripped.
pub fn decode_unknown(body: &[u8]) -> Bytes {
    Bytes::copy_from_slice(body.strip_suffix(b"\0").unwrap_or(body))
}

fn malformed(command: &str, detail: &str) -> MilterError {
    MilterError::Protocol(format!("malformed {} payload: {}", command, detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_inet() {
        let mut body = b"mail.example.com\0".to_vec();
        body.push(b'4');
        body.extend_from_slice(&25u16.to_be_bytes());
        body.extend_from_slice(b"192.0.2.1\0");

        let connect = Connect::decode(&body).unwrap();

        assert_eq!(&connect.hostname[..], b"mail.example.com");
        assert_eq!(connect.family, Family::Inet);
        assert_eq!(connect.port, 25);
        assert_eq!(connect.address.as_deref(), Some(&b"192.0.2.1"[..]));
    }

    #[test]
    fn test_connect_unix() {
        let mut body = b"localhost\0L".to_vec();
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(b"/var/run/smtp.sock\0");

        let connect = Connect::decode(&body).unwrap();
        assert_eq!(connect.family, Family::Unix);
        assert_eq!(connect.address.as_deref(), Some(&b"/var/run/smtp.sock"[..]));
    }

    #[test]
    fn test_connect_unknown_family() {
        let connect = Connect::decode(b"[unknown]\0U").unwrap();
        assert_eq!(connect.family, Family::Unknown);
        assert_eq!(connect.port, 0);
        assert!(connect.address.is_none());
    }

    #[test]
    fn test_connect_malformed() {
        assert!(Connect::decode(b"no-terminator").is_err());
        assert!(Connect::decode(b"host\0").is_err());
        assert!(Connect::decode(b"host\0X").is_err());
        assert!(Connect::decode(b"host\04\0").is_err());
    }

    #[test]
    fn test_envelope_with_args() {
        let env = Envelope::decode(b"<a@example.com>\0SIZE=100\0BODY=8BITMIME\0").unwrap();

        assert_eq!(&env.address[..], b"<a@example.com>");
        assert_eq!(env.args.len(), 2);
        assert_eq!(&env.args[1][..], b"BODY=8BITMIME");
        assert!(Envelope::decode(b"").is_err());
    }

    #[test]
    fn test_header_empty_value() {
        let header = Header::decode(b"X-Empty\0\0").unwrap();
        assert_eq!(&header.name[..], b"X-Empty");
        assert!(header.value.is_empty());

        let header = Header::decode(b"Subject\0hello world\0").unwrap();
        assert_eq!(&header.value[..], b"hello world");
    }

    #[test]
    fn test_helo_and_unknown() {
        assert_eq!(&decode_helo(b"example.com\0").unwrap()[..], b"example.com");
        assert!(decode_helo(b"").is_err());
        assert_eq!(&decode_unknown(b"XFOO bar\0")[..], b"XFOO bar");
    }
}
