//! Control-channel codecs and data-channel tag framing
//!
//! The control channel carries one JSON handshake from the agent followed
//! by newline-terminated `new-tunnel:<alias>` commands from the server.
//! The data channel starts with a newline-terminated alias tag; whatever
//! follows the newline is relay payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::messages::{validate_alias, ControlCommand, Handshake, ProtocolError};
use crate::{MAX_ALIAS_LEN, MAX_COMMAND_LEN, MAX_HANDSHAKE_LEN, NEW_TUNNEL_PREFIX};

/// Size of the single read that carries the data tag
const TAG_READ_SIZE: usize = 4096;

/// Server side of the control channel.
///
/// Decodes exactly one [`Handshake`]; anything the agent sends after it is
/// discarded. Encodes [`ControlCommand`]s.
#[derive(Debug, Default)]
pub struct ServerControlCodec {
    handshake_received: bool,
}

impl ServerControlCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ServerControlCodec {
    type Item = Handshake;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.handshake_received {
            if !src.is_empty() {
                debug!("Discarding {} unexpected bytes on control channel", src.len());
                src.clear();
            }
            return Ok(None);
        }

        let mut stream = serde_json::Deserializer::from_slice(src).into_iter::<Handshake>();
        match stream.next() {
            Some(Ok(handshake)) => {
                let consumed = stream.byte_offset();
                src.advance(consumed);
                handshake.validate().map_err(|e| {
                    ProtocolError::MalformedHandshake(e.to_string())
                })?;
                self.handshake_received = true;
                Ok(Some(handshake))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_HANDSHAKE_LEN {
                    return Err(ProtocolError::HandshakeTooLarge(MAX_HANDSHAKE_LEN));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(ProtocolError::MalformedHandshake(e.to_string())),
            // Only whitespace so far
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(handshake) => Ok(Some(handshake)),
            None if !self.handshake_received && src.iter().any(|b| !b.is_ascii_whitespace()) => {
                Err(ProtocolError::MalformedHandshake(
                    "connection closed mid-handshake".to_string(),
                ))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<ControlCommand> for ServerControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ControlCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.to_string();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Agent side of the control channel.
///
/// Encodes the [`Handshake`] as a single JSON line and decodes
/// newline-terminated [`ControlCommand`]s. Unrecognized lines are skipped.
#[derive(Debug, Default)]
pub struct AgentControlCodec;

impl AgentControlCodec {
    pub fn new() -> Self {
        Self
    }

    fn parse_line(line: &[u8]) -> Result<Option<ControlCommand>, ProtocolError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        match line.strip_prefix(NEW_TUNNEL_PREFIX) {
            Some(alias) => {
                validate_alias(alias)?;
                Ok(Some(ControlCommand::new_tunnel(alias)))
            }
            None => {
                warn!("Ignoring unrecognized control command: {:?}", line);
                Ok(None)
            }
        }
    }
}

impl Decoder for AgentControlCodec {
    type Item = ControlCommand;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_COMMAND_LEN {
                    return Err(ProtocolError::CommandTooLong(MAX_COMMAND_LEN));
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            if let Some(command) = Self::parse_line(&line[..pos])? {
                return Ok(Some(command));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(command) = self.decode(src)? {
            return Ok(Some(command));
        }
        // A peer that does not terminate its last command still gets it honoured
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Self::parse_line(&rest)
    }
}

impl Encoder<Handshake> for AgentControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))?;
        if json.len() > MAX_HANDSHAKE_LEN {
            return Err(ProtocolError::HandshakeTooLarge(MAX_HANDSHAKE_LEN));
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Alias tag read from the head of a data connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTag {
    pub alias: String,
    /// Payload bytes that arrived in the same read as the tag
    pub leftover: Bytes,
}

impl DataTag {
    /// Bytes the agent writes before relaying
    pub fn encode(alias: &str) -> Result<Bytes, ProtocolError> {
        validate_alias(alias)?;
        let mut buf = BytesMut::with_capacity(alias.len() + 1);
        buf.put_slice(alias.as_bytes());
        buf.put_u8(b'\n');
        Ok(buf.freeze())
    }
}

/// Read the alias tag from a freshly accepted data connection.
///
/// The tag is the first read on the connection. If that read contains a
/// `\n`, the alias ends there and the bytes after it are returned in
/// [`DataTag::leftover`]; otherwise the whole read is the bare alias.
pub async fn read_data_tag<R>(reader: &mut R) -> Result<DataTag, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(TAG_READ_SIZE);
    if reader.read_buf(&mut buf).await? == 0 {
        return Err(ProtocolError::IncompleteTag);
    }

    let newline = buf.iter().position(|b| *b == b'\n');
    let (head, leftover) = match newline {
        Some(pos) => {
            let line = buf.split_to(pos + 1);
            (line.freeze().slice(..pos), buf.freeze())
        }
        None => (buf.freeze(), Bytes::new()),
    };

    let raw: &[u8] = head.strip_suffix(b"\r").unwrap_or(&head[..]);
    if raw.len() > MAX_ALIAS_LEN {
        return Err(ProtocolError::TagTooLong(MAX_ALIAS_LEN));
    }
    let alias = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::InvalidAlias {
            alias: String::from_utf8_lossy(raw).into_owned(),
            reason: "not valid UTF-8",
        })?
        .to_string();
    validate_alias(&alias)?;

    Ok(DataTag { alias, leftover })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Destination;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_server_decodes_handshake_without_newline() {
        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&br#"{"web":"localhost:8080"}"#[..]);

        let handshake = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            handshake.destinations["web"],
            Destination::new("localhost", 8080)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_server_waits_for_split_handshake() {
        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&br#"{"web":"local"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"host:8080\"}\n");
        let handshake = codec.decode(&mut buf).unwrap().unwrap();
        assert!(handshake.supports("web"));
    }

    #[test]
    fn test_server_rejects_malformed_handshake() {
        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&b"hello there"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedHandshake(_))
        ));

        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&br#"{"bad alias":"localhost:80"}"#[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_server_rejects_oversized_handshake() {
        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&b"{\"web\":\""[..]);
        buf.extend_from_slice(&vec![b'a'; MAX_HANDSHAKE_LEN + 1]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::HandshakeTooLarge(_))
        ));
    }

    #[test]
    fn test_server_discards_bytes_after_handshake() {
        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&b"{}\ntrailing garbage"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_server_eof_mid_handshake_is_malformed() {
        let mut codec = ServerControlCodec::new();
        let mut buf = BytesMut::from(&br#"{"web":"#[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_agent_decodes_coalesced_commands() {
        let mut codec = AgentControlCodec::new();
        let mut buf = BytesMut::from(&b"new-tunnel:web\nnew-tunnel:ssh\r\nbogus\nnew-tunnel:db"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlCommand::new_tunnel("web"))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlCommand::new_tunnel("ssh"))
        );
        // "bogus" is skipped, "db" has no terminator yet
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(ControlCommand::new_tunnel("db"))
        );
    }

    #[tokio::test]
    async fn test_control_channel_over_duplex() {
        let (agent_side, server_side) = tokio::io::duplex(1024);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let mut agent_tx = FramedWrite::new(agent_write, AgentControlCodec::new());
        let mut agent_rx = FramedRead::new(agent_read, AgentControlCodec::new());
        let mut server_tx = FramedWrite::new(server_write, ServerControlCodec::new());
        let mut server_rx = FramedRead::new(server_read, ServerControlCodec::new());

        let mut destinations = std::collections::BTreeMap::new();
        destinations.insert("web".to_string(), Destination::new("localhost", 8080));
        agent_tx.send(Handshake::new(destinations)).await.unwrap();

        let handshake = server_rx.next().await.unwrap().unwrap();
        assert!(handshake.supports("web"));

        server_tx
            .send(ControlCommand::new_tunnel("web"))
            .await
            .unwrap();
        assert_eq!(
            agent_rx.next().await.unwrap().unwrap(),
            ControlCommand::new_tunnel("web")
        );
    }

    #[tokio::test]
    async fn test_read_data_tag_keeps_payload() {
        let (mut agent, mut server) = tokio::io::duplex(1024);
        agent.write_all(b"web\nSSH-2.0-banner").await.unwrap();

        let tag = read_data_tag(&mut server).await.unwrap();
        assert_eq!(tag.alias, "web");
        assert_eq!(&tag.leftover[..], b"SSH-2.0-banner");
    }

    #[tokio::test]
    async fn test_read_data_tag_bare_alias() {
        let (mut agent, mut server) = tokio::io::duplex(1024);
        agent.write_all(b"web").await.unwrap();

        // No terminator and the connection stays open
        let tag = read_data_tag(&mut server).await.unwrap();
        assert_eq!(tag.alias, "web");
        assert!(tag.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_data_tag_crlf() {
        let (mut agent, mut server) = tokio::io::duplex(1024);
        agent.write_all(b"web\r\n").await.unwrap();

        let tag = read_data_tag(&mut server).await.unwrap();
        assert_eq!(tag.alias, "web");
        assert!(tag.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_data_tag_errors() {
        let (agent, mut server) = tokio::io::duplex(1024);
        drop(agent);
        assert!(matches!(
            read_data_tag(&mut server).await,
            Err(ProtocolError::IncompleteTag)
        ));

        let (mut agent, mut server) = tokio::io::duplex(4096);
        agent.write_all(&[b'a'; MAX_ALIAS_LEN + 10]).await.unwrap();
        assert!(matches!(
            read_data_tag(&mut server).await,
            Err(ProtocolError::TagTooLong(_))
        ));

        let (mut agent, mut server) = tokio::io::duplex(1024);
        agent.write_all(b"has space\npayload").await.unwrap();
        assert!(matches!(
            read_data_tag(&mut server).await,
            Err(ProtocolError::InvalidAlias { .. })
        ));
    }

    #[test]
    fn test_data_tag_encode() {
        assert_eq!(&DataTag::encode("web").unwrap()[..], b"web\n");
        assert!(DataTag::encode("has space").is_err());
    }
}
