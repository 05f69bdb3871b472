use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Write;
use std::{io, result, str};

/// Maximum size of a DATA payload block, per RFC 1350.
pub const MAX_BLOCK_SIZE: usize = 512;

/// Maximum size of any single TFTP datagram this server will accept for a
/// RRQ/WRQ request: 2 opcode bytes + up to 510 bytes of filename+mode.
pub const MAX_REQUEST_SIZE: usize = 512;

/// Maximum size of any datagram the server will ever write into a caller
/// buffer: 2 opcode + 2 block number + 512 payload bytes.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;

#[derive(Debug)]
pub enum ParseError {
    /// Buffer too short to contain the fields the opcode requires, or a
    /// required NUL terminator was missing.
    InvalidPacket,
    /// Opcode field did not match any of the five defined message types.
    InvalidOpcode,
    /// RRQ/WRQ mode identifier was not `netascii`, `octet`, or `mail`.
    InvalidMode,
    /// Caller-provided buffer was too small to serialize into.
    BufferTooSmall,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ParseError::InvalidPacket => "invalid packet",
            ParseError::InvalidOpcode => "invalid opcode",
            ParseError::InvalidMode => "invalid transfer mode",
            ParseError::BufferTooSmall => "buffer too small",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(_: io::Error) -> Self {
        ParseError::InvalidPacket
    }
}

pub type Result<T> = result::Result<T, ParseError>;

macro_rules! primitive_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $enum_name:ident of $base_int:tt {
            $( $variant:ident = $value:expr, )+
        }
    ) => {
        $( #[$enum_attr] )*
        #[repr($base_int)]
        pub enum $enum_name {
            $( $variant = $value, )+
        }

        impl $enum_name {
            fn from_u16(i: $base_int) -> Option<$enum_name> {
                match i {
                    $( $value => Some($enum_name::$variant), )+
                    _ => None,
                }
            }
        }
    }
}

primitive_enum!(
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub enum OpCode of u16 {
        Rrq = 1,
        Wrq = 2,
        Data = 3,
        Ack = 4,
        Error = 5,
    }
);

primitive_enum!(
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub enum ErrorCode of u16 {
        NotDefined = 0,
        FileNotFound = 1,
        AccessViolation = 2,
        DiskFull = 3,
        IllegalOperation = 4,
        UnknownTransferId = 5,
        FileAlreadyExists = 6,
        NoSuchUser = 7,
    }
);

impl ErrorCode {
    /// Degrades an on-the-wire code to `NotDefined` rather than failing to
    /// parse, per RFC 1350 (unknown error codes are still valid packets).
    fn from_wire(code: u16) -> ErrorCode {
        ErrorCode::from_u16(code).unwrap_or(ErrorCode::NotDefined)
    }

    /// Default human-readable message used when a session raises this error
    /// without a bespoke message.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransferId => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl From<ErrorCode> for Packet {
    fn from(code: ErrorCode) -> Packet {
        Packet::Error {
            code,
            message: code.default_message().to_owned(),
        }
    }
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Mode {
    Octet,
    Netascii,
    Mail,
}

impl Mode {
    fn parse(s: &str) -> Result<Self> {
        if "octet".eq_ignore_ascii_case(s) {
            Ok(Mode::Octet)
        } else if "netascii".eq_ignore_ascii_case(s) {
            Ok(Mode::Netascii)
        } else if "mail".eq_ignore_ascii_case(s) {
            Ok(Mode::Mail)
        } else {
            Err(ParseError::InvalidMode)
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Mode::Octet => "octet",
            Mode::Netascii => "netascii",
            Mode::Mail => "mail",
        };
        f.write_str(s)
    }
}

/// A parsed TFTP message. `Request` carries a boolean discriminating RRQ
/// from WRQ, since the two opcodes share an identical body layout.
#[derive(PartialEq, Clone, Debug)]
pub enum Packet {
    Request {
        is_write: bool,
        filename: String,
        mode: Mode,
    },
    Data {
        block_num: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Packet {
    pub fn read_request(filename: impl Into<String>, mode: Mode) -> Packet {
        Packet::Request {
            is_write: false,
            filename: filename.into(),
            mode,
        }
    }

    pub fn write_request(filename: impl Into<String>, mode: Mode) -> Packet {
        Packet::Request {
            is_write: true,
            filename: filename.into(),
            mode,
        }
    }

    /// Parses a packet from its wire representation.
    pub fn parse(mut bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < 2 {
            return Err(ParseError::InvalidPacket);
        }
        let opcode =
            OpCode::from_u16(bytes.read_u16::<BigEndian>()?).ok_or(ParseError::InvalidOpcode)?;
        match opcode {
            OpCode::Rrq => parse_request(bytes, false),
            OpCode::Wrq => parse_request(bytes, true),
            OpCode::Data => parse_data(bytes),
            OpCode::Ack => parse_ack(bytes),
            OpCode::Error => parse_error(bytes),
        }
    }

    /// Serializes the packet into `buf`, returning the number of bytes
    /// written. `buf` must be at least `MAX_PACKET_SIZE` bytes for any
    /// Data packet; smaller buffers fail with `BufferTooSmall` rather than
    /// panicking or truncating.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor: &mut [u8] = buf;
        let start_len = cursor.len();
        self.write_bytes_to(&mut cursor)
            .map_err(|_| ParseError::BufferTooSmall)?;
        Ok(start_len - cursor.len())
    }

    /// Serializes into an owned, appropriately-sized buffer. Convenience
    /// wrapper over `serialize` for call sites that don't already hold a
    /// reusable buffer (mainly tests).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let n = self
            .serialize(&mut buf)
            .expect("MAX_PACKET_SIZE buffer is always large enough");
        buf.truncate(n);
        buf
    }

    fn write_bytes_to(&self, buf: &mut impl Write) -> io::Result<()> {
        match self {
            Packet::Request {
                is_write,
                filename,
                mode,
            } => {
                let opcode = if *is_write { OpCode::Wrq } else { OpCode::Rrq };
                buf.write_u16::<BigEndian>(opcode as u16)?;
                write!(buf, "{}\0{}\0", filename, mode)
            }
            Packet::Data { block_num, data } => {
                buf.write_u16::<BigEndian>(OpCode::Data as u16)?;
                buf.write_u16::<BigEndian>(*block_num)?;
                buf.write_all(data)
            }
            Packet::Ack(block_num) => {
                buf.write_u16::<BigEndian>(OpCode::Ack as u16)?;
                buf.write_u16::<BigEndian>(*block_num)
            }
            Packet::Error { code, message } => {
                buf.write_u16::<BigEndian>(OpCode::Error as u16)?;
                buf.write_u16::<BigEndian>(*code as u16)?;
                write!(buf, "{}\0", message)
            }
        }
    }
}

/// Locates the first NUL in `bytes`, returning the (non-NUL-terminated)
/// string before it and the remainder after it.
fn split_at_nul(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let pos = bytes.iter().position(|&b| b == 0)?;
    let s = str::from_utf8(&bytes[..pos]).ok()?;
    Some((s, &bytes[pos + 1..]))
}

fn parse_request(bytes: &[u8], is_write: bool) -> Result<Packet> {
    if bytes.len() > MAX_REQUEST_SIZE {
        return Err(ParseError::InvalidPacket);
    }
    let (filename, rest) = split_at_nul(bytes).ok_or(ParseError::InvalidPacket)?;
    let (mode_str, _rest) = split_at_nul(rest).ok_or(ParseError::InvalidPacket)?;
    let mode = Mode::parse(mode_str)?;
    Ok(Packet::Request {
        is_write,
        filename: filename.to_owned(),
        mode,
    })
}

fn parse_data(mut bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < 2 {
        return Err(ParseError::InvalidPacket);
    }
    let block_num = bytes.read_u16::<BigEndian>()?;
    Ok(Packet::Data {
        block_num,
        data: bytes.to_vec(),
    })
}

fn parse_ack(mut bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < 2 {
        return Err(ParseError::InvalidPacket);
    }
    let block_num = bytes.read_u16::<BigEndian>()?;
    Ok(Packet::Ack(block_num))
}

fn parse_error(mut bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < 2 {
        return Err(ParseError::InvalidPacket);
    }
    let code = ErrorCode::from_wire(bytes.read_u16::<BigEndian>()?);
    let (message, _rest) = split_at_nul(bytes).ok_or(ParseError::InvalidPacket)?;
    Ok(Packet::Error {
        code,
        message: message.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn ack_round_trip() {
        let p = Packet::Ack(10);
        let bytes = p.to_bytes();
        assert_eq!(bytes, vec![0x00, 0x04, 0x00, 0x0A]);
        assert_eq!(Packet::parse(&bytes).unwrap(), p);
    }

    #[test]
    fn rrq_round_trip() {
        let p = Packet::read_request("test.txt", Mode::Octet);
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), 17);
        let mut expected = vec![0x00, 0x01];
        expected.extend_from_slice(b"test.txt\0octet\0");
        assert_eq!(bytes, expected);
        assert_eq!(Packet::parse(&bytes).unwrap(), p);
    }

    #[test]
    fn data_round_trip() {
        let p = Packet::Data {
            block_num: 1,
            data: b"Hello World".to_vec(),
        };
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[..4], &[0x00, 0x03, 0x00, 0x01]);
        assert_eq!(&bytes[4..], b"Hello World");
        assert_eq!(Packet::parse(&bytes).unwrap(), p);
    }

    #[test]
    fn error_round_trip() {
        let p = Packet::Error {
            code: ErrorCode::FileNotFound,
            message: "Not found".to_owned(),
        };
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), 14);
        assert_eq!(Packet::parse(&bytes).unwrap(), p);
    }

    #[test]
    fn mode_case_insensitive() {
        let bytes = {
            let mut v = vec![0x00, 0x01];
            v.extend_from_slice(b"f\0OcTeT\0");
            v
        };
        assert_matches!(
            Packet::parse(&bytes),
            Ok(Packet::Request {
                mode: Mode::Octet,
                ..
            })
        );
    }

    #[test]
    fn unknown_mode_is_error() {
        let mut v = vec![0x00, 0x01];
        v.extend_from_slice(b"f\0unknown\0");
        assert_matches!(Packet::parse(&v), Err(ParseError::InvalidMode));
    }

    #[test]
    fn missing_nul_is_error() {
        let mut v = vec![0x00, 0x01];
        v.extend_from_slice(b"f");
        assert_matches!(Packet::parse(&v), Err(ParseError::InvalidPacket));
    }

    #[test]
    fn unknown_opcode_is_error() {
        assert_matches!(Packet::parse(&[0x00, 0x09]), Err(ParseError::InvalidOpcode));
    }

    #[test]
    fn too_short_is_error() {
        assert_matches!(Packet::parse(&[0x00]), Err(ParseError::InvalidPacket));
    }

    #[test]
    fn unknown_error_code_degrades_to_not_defined() {
        let mut v = vec![0x00, 0x05, 0x00, 0x63];
        v.push(0);
        assert_matches!(
            Packet::parse(&v),
            Ok(Packet::Error {
                code: ErrorCode::NotDefined,
                ..
            })
        );
    }

    #[test]
    fn rrq_max_size() {
        let p = Packet::read_request(
            str::from_utf8(&[b'x'; MAX_REQUEST_SIZE - 6]).unwrap(),
            Mode::Octet,
        );
        let bytes = p.to_bytes();
        assert_matches!(Packet::parse(&bytes), Err(ParseError::InvalidPacket));
    }

    #[test]
    fn buffer_too_small_fails_cleanly() {
        let p = Packet::Data {
            block_num: 1,
            data: vec![0u8; MAX_BLOCK_SIZE],
        };
        let mut small = [0u8; 4];
        assert_matches!(p.serialize(&mut small), Err(ParseError::BufferTooSmall));
    }
}
