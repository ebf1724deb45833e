use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const TAG_LEN: usize = 4;
const FIELD_SEPARATOR: char = ' ';
const RECORD_SEPARATOR: char = ':';

/// Longest control frame accepted, newline excluded.
pub const MAX_LINE: usize = 64 * 1024;

/// One participant as the directory knows it: a screen name plus the
/// datagram endpoint its peers should send to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub name: String,
    pub ip: String,
    pub udp_port: u16,
}

impl Member {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, udp_port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            udp_port,
        }
    }

    /// Resolves the declared ip/port pair into a socket address.
    pub fn endpoint(&self) -> Result<SocketAddr, ProtocolError> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(self.ip.clone()))?;
        Ok(SocketAddr::new(ip, self.udp_port))
    }

    fn parse_record(tag: &'static str, record: &str) -> Result<Self, ProtocolError> {
        let [name, ip, port] = split_fields::<3>(tag, record)?;
        let udp_port = port
            .parse()
            .map_err(|_| ProtocolError::InvalidPort(port.to_string()))?;
        Ok(Self::new(name, ip, udp_port))
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.ip, self.udp_port)
    }
}

/// Returns true when `name` can travel as a single wire field.
pub fn is_valid_name(name: &str) -> bool {
    is_valid_field(name)
}

fn is_valid_field(field: &str) -> bool {
    !field.is_empty()
        && !field
            .chars()
            .any(|c| c == RECORD_SEPARATOR || c.is_whitespace())
}

/// Messages carried on the TCP control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Helo(Member),
    Acpt(Vec<Member>),
    Rjct { name: String },
    Exit,
}

impl ControlMessage {
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (tag, payload) = split_tag(line)?;
        match tag {
            "HELO" => Ok(Self::Helo(Member::parse_record("HELO", payload)?)),
            "ACPT" => {
                if payload.is_empty() {
                    return Ok(Self::Acpt(Vec::new()));
                }
                payload
                    .split(RECORD_SEPARATOR)
                    .map(|record| Member::parse_record("ACPT", record))
                    .collect::<Result<_, _>>()
                    .map(Self::Acpt)
            }
            "RJCT" => {
                let [name] = split_fields::<1>("RJCT", payload)?;
                Ok(Self::Rjct {
                    name: name.to_string(),
                })
            }
            "EXIT" => {
                split_fields::<0>("EXIT", payload)?;
                Ok(Self::Exit)
            }
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }

    /// The message as it goes on the wire, newline included.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(member) => write!(f, "HELO {member}"),
            Self::Acpt(records) => {
                f.write_str("ACPT ")?;
                for (index, record) in records.iter().enumerate() {
                    if index > 0 {
                        write!(f, "{RECORD_SEPARATOR}")?;
                    }
                    write!(f, "{record}")?;
                }
                Ok(())
            }
            Self::Rjct { name } => write!(f, "RJCT {name}"),
            Self::Exit => f.write_str("EXIT"),
        }
    }
}

/// Messages carried in datagrams: server announcements and peer chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMessage {
    Join(Member),
    Exit { name: String },
    Mesg { sender: String, text: String },
}

impl EventMessage {
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (tag, payload) = split_tag(line)?;
        match tag {
            "JOIN" => Ok(Self::Join(Member::parse_record("JOIN", payload)?)),
            "EXIT" => {
                let [name] = split_fields::<1>("EXIT", payload)?;
                Ok(Self::Exit {
                    name: name.to_string(),
                })
            }
            "MESG" => {
                let (sender, text) = payload
                    .split_once(RECORD_SEPARATOR)
                    .ok_or(ProtocolError::MissingSeparator { tag: "MESG" })?;
                if !is_valid_field(sender) {
                    return Err(ProtocolError::InvalidField(sender.to_string()));
                }
                Ok(Self::Mesg {
                    sender: sender.to_string(),
                    text: text.strip_prefix(FIELD_SEPARATOR).unwrap_or(text).to_string(),
                })
            }
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }

    pub fn from_datagram(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(datagram).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::decode(line)
    }

    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join(member) => write!(f, "JOIN {member}"),
            Self::Exit { name } => write!(f, "EXIT {name}"),
            Self::Mesg { sender, text } => write!(f, "MESG {sender}: {text}"),
        }
    }
}

/// Splits `TAG payload` into its 4-character tag and the payload after the
/// single separating space.
fn split_tag(line: &str) -> Result<(&str, &str), ProtocolError> {
    let line = line.trim_end_matches(LINE_ENDINGS);
    let unknown = || ProtocolError::UnknownCommand(line.to_string());

    let tag = line.get(..TAG_LEN).ok_or_else(unknown)?;
    let rest = &line[TAG_LEN..];
    let payload = match rest.strip_prefix(FIELD_SEPARATOR) {
        Some(payload) => payload,
        None if rest.is_empty() => "",
        None => return Err(unknown()),
    };
    Ok((tag, payload))
}

fn split_fields<'a, const N: usize>(
    tag: &'static str,
    payload: &'a str,
) -> Result<[&'a str; N], ProtocolError> {
    let fields: Vec<&str> = if payload.is_empty() {
        Vec::new()
    } else {
        payload.split(FIELD_SEPARATOR).collect()
    };
    let found = fields.len();
    let fields: [&str; N] = fields
        .try_into()
        .map_err(|_| ProtocolError::MalformedFields {
            tag,
            expected: N,
            found,
        })?;

    if let Some(field) = fields.iter().find(|field| !is_valid_field(field)) {
        return Err(ProtocolError::InvalidField(field.to_string()));
    }
    Ok(fields)
}

/// Reads one newline-terminated frame, buffering across partial reads.
///
/// Returns `Ok(None)` on a clean EOF. A stream that ends in the middle of a
/// frame is reported as `UnexpectedEof`.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    read_frame(reader, &mut Vec::new()).await
}

/// Like [`read_line`], but keeps the bytes of an unfinished frame in `buf`
/// when the future is dropped, so it can sit in a `select!` branch and be
/// called again to pick up where it left off.
///
/// Frames longer than [`MAX_LINE`] bytes are rejected as `InvalidData`.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let room = (MAX_LINE + 1).saturating_sub(buf.len()) as u64;
        (&mut *reader).take(room).read_until(b'\n', buf).await?;

        if buf.last() != Some(&b'\n') {
            let error = if buf.len() > MAX_LINE {
                io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length")
            } else if buf.is_empty() {
                return Ok(None);
            } else {
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame")
            };
            buf.clear();
            return Err(error);
        }

        let frame = String::from_utf8(std::mem::take(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame is not valid utf-8"))?;
        let trimmed = frame.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn write_control<W>(writer: &mut W, message: &ControlMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message.encode().as_bytes()).await?;
    writer.flush().await
}
