use super::codec::{
    self, Acknowledge, DataValue, MessageHeader, NodeId, RequestHeader, SecureChannel, StatusCode,
    Variant,
};
use bytes::BytesMut;
use plcbench_common::{BenchError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

const DEFAULT_PORT: u16 = 4840;
const CHANNEL_LIFETIME_MS: u32 = 3_600_000;

fn lost(err: std::io::Error) -> BenchError {
    BenchError::connection(format!("OPC UA connection lost: {}", err))
}

/// `host:port` of an `opc.tcp://` endpoint URL
pub fn socket_addr(endpoint_url: &str) -> Result<String> {
    let rest = endpoint_url
        .strip_prefix("opc.tcp://")
        .ok_or_else(|| BenchError::config(format!("not an opc.tcp endpoint: {}", endpoint_url)))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(BenchError::config(format!("endpoint has no host: {}", endpoint_url)));
    }
    if authority.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        Ok(authority.to_string())
    } else {
        Ok(format!("{}:{}", authority, DEFAULT_PORT))
    }
}

/// An activated session on a secure channel with security policy None
pub struct UaClient {
    stream: TcpStream,
    /// Received bytes not yet consumed as a message; survives a timed-out wait
    rx: BytesMut,
    limits: Acknowledge,
    channel: SecureChannel,
    auth_token: NodeId,
    sequence_number: u32,
    next_request_id: u32,
    next_handle: u32,
    timeout: Duration,
}

impl UaClient {
    /// Connect, open the secure channel and activate an anonymous session.
    ///
    /// Every failure here is a connection error.
    pub async fn connect(
        endpoint_url: &str,
        anonymous_policy_id: &str,
        session_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let addr = socket_addr(endpoint_url)?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| BenchError::connection(format!("timed out connecting to {}", addr)))?
            .map_err(|e| BenchError::connection(format!("failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).map_err(lost)?;

        let establish = tokio::time::timeout(
            timeout,
            Self::establish(stream, endpoint_url, anonymous_policy_id, session_timeout, timeout),
        )
        .await
        .map_err(|_| BenchError::connection(format!("OPC UA handshake with {} timed out", addr)))?;
        establish.map_err(|e| match e {
            BenchError::Connection(msg) => BenchError::Connection(msg),
            other => BenchError::connection(format!("OPC UA session setup failed: {}", other)),
        })
    }

    async fn establish(
        mut stream: TcpStream,
        endpoint_url: &str,
        anonymous_policy_id: &str,
        session_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let mut rx = BytesMut::with_capacity(codec::BUFFER_SIZE as usize);
        stream.write_all(&codec::hello(endpoint_url)).await.map_err(lost)?;
        let (header, body) = read_message(&mut stream, &mut rx).await?;
        let limits = match &header.message_type {
            b"ACK" => codec::parse_acknowledge(&body)?,
            other => return Err(unexpected_message(other, &body)),
        };

        let open_header = RequestHeader::new(NodeId::null(), 1, timeout.as_millis() as u32);
        stream
            .write_all(&codec::open_secure_channel(1, 1, &open_header, CHANNEL_LIFETIME_MS))
            .await
            .map_err(lost)?;
        let (header, body) = read_message(&mut stream, &mut rx).await?;
        let channel = match &header.message_type {
            b"OPN" => codec::parse_open_secure_channel(&body)?,
            other => return Err(unexpected_message(other, &body)),
        };
        debug!(
            "Secure channel {} open (token {}, lifetime {} ms)",
            channel.channel_id, channel.token_id, channel.revised_lifetime_ms
        );

        let mut client = Self {
            stream,
            rx,
            limits,
            channel,
            auth_token: NodeId::null(),
            sequence_number: 2,
            next_request_id: 2,
            next_handle: 2,
            timeout,
        };

        let header = client.request_header();
        let body = codec::create_session(
            &header,
            endpoint_url,
            "plcbench",
            session_timeout.as_millis() as f64,
        );
        let session = codec::parse_create_session(&client.exchange(body).await?)?;
        client.auth_token = session.authentication_token;
        debug!("Session {} created", session.session_id);

        let header = client.request_header();
        let body = codec::activate_session(&header, anonymous_policy_id);
        codec::parse_activate_session(&client.exchange(body).await?)?;
        Ok(client)
    }

    fn request_header(&mut self) -> RequestHeader {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        RequestHeader::new(self.auth_token.clone(), handle, self.timeout.as_millis() as u32)
    }

    pub async fn write(&mut self, items: &[(NodeId, Variant)]) -> Result<Vec<StatusCode>> {
        let header = self.request_header();
        let body = codec::write_request(&header, items);
        let response = self.request(body).await?;
        let results = codec::parse_write_response(&response)?;
        if results.len() != items.len() {
            return Err(codec::codec_error(format!(
                "write returned {} results for {} items",
                results.len(),
                items.len()
            )));
        }
        Ok(results)
    }

    pub async fn read(&mut self, nodes: &[NodeId]) -> Result<Vec<DataValue>> {
        let header = self.request_header();
        let body = codec::read_request(&header, nodes);
        let response = self.request(body).await?;
        codec::parse_read_response(&response)
    }

    /// Close the session and the secure channel. Failures are logged, not returned.
    pub async fn close(mut self) {
        let header = self.request_header();
        match self.request(codec::close_session(&header)).await {
            Ok(body) => {
                if let Err(e) = codec::parse_close_session(&body) {
                    warn!("CloseSession failed: {}", e);
                }
            }
            Err(e) => warn!("CloseSession failed: {}", e),
        }

        let header = self.request_header();
        let request_id = self.allocate_request_id();
        let sequence_number = self.allocate_sequence_number();
        let message = codec::symmetric(
            b"CLO",
            &self.channel,
            sequence_number,
            request_id,
            &codec::close_secure_channel(&header),
        );
        if let Err(e) = self.stream.write_all(&message).await {
            trace!("CloseSecureChannel not sent: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!("OPC UA shutdown: {}", e);
        }
    }

    fn allocate_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    fn allocate_sequence_number(&mut self) -> u32 {
        let n = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1).max(1);
        n
    }

    /// Send a service request and wait for its response; a timeout is an operation error
    async fn request(&mut self, body: BytesMut) -> Result<Vec<u8>> {
        let request_id = self.send(&body).await?;
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.recv_response(request_id))
            .await
            .map_err(|_| codec::codec_error(format!("no response within {:?}", timeout)))?
    }

    /// Request/response used during session setup, where the caller bounds the time
    async fn exchange(&mut self, body: BytesMut) -> Result<Vec<u8>> {
        let request_id = self.send(&body).await?;
        self.recv_response(request_id).await
    }

    async fn send(&mut self, body: &[u8]) -> Result<u32> {
        let request_id = self.allocate_request_id();
        let sequence_number = self.allocate_sequence_number();
        let message = codec::symmetric(b"MSG", &self.channel, sequence_number, request_id, body);
        let limit = self.limits.receive_buffer_size as usize;
        if limit > 0 && message.len() > limit {
            return Err(codec::codec_error(format!(
                "request of {} bytes exceeds the server buffer of {} bytes",
                message.len(),
                limit
            )));
        }
        self.stream.write_all(&message).await.map_err(lost)?;
        Ok(request_id)
    }

    /// Collect the chunks answering `request_id`, discarding answers to earlier requests
    async fn recv_response(&mut self, request_id: u32) -> Result<Vec<u8>> {
        let mut assembled = Vec::new();
        loop {
            let (header, body) = read_message(&mut self.stream, &mut self.rx).await?;
            if &header.message_type != b"MSG" {
                return Err(unexpected_message(&header.message_type, &body));
            }
            let (chunk, payload) = codec::parse_chunk(&body)?;
            if chunk.request_id != request_id {
                debug!(
                    "discarding stale OPC UA response (request {}, waiting for {})",
                    chunk.request_id, request_id
                );
                continue;
            }
            match header.chunk_type {
                b'C' => assembled.extend_from_slice(payload),
                b'F' => {
                    assembled.extend_from_slice(payload);
                    return Ok(assembled);
                }
                _ => return Err(codec::codec_error("server aborted the response")),
            }
        }
    }
}

/// Next complete message. A partial message stays in `rx`, so dropping this future on
/// a timeout does not lose framing.
async fn read_message(stream: &mut TcpStream, rx: &mut BytesMut) -> Result<(MessageHeader, BytesMut)> {
    loop {
        if let Some(message) = split_message(rx)? {
            return Ok(message);
        }
        let read = stream.read_buf(rx).await.map_err(lost)?;
        if read == 0 {
            return Err(BenchError::connection("OPC UA connection closed by peer"));
        }
    }
}

/// Take one whole message off the front of `rx`, returning its header and body
fn split_message(rx: &mut BytesMut) -> Result<Option<(MessageHeader, BytesMut)>> {
    let Some(raw) = rx.get(..codec::HEADER_LEN) else {
        return Ok(None);
    };
    let raw: [u8; codec::HEADER_LEN] = raw
        .try_into()
        .map_err(|_| BenchError::connection("OPC UA stream out of sync"))?;
    let header = codec::parse_header(&raw)
        .map_err(|e| BenchError::connection(format!("OPC UA stream out of sync: {}", e)))?;
    let size = header.size as usize;
    if rx.len() < size {
        rx.reserve(size - rx.len());
        return Ok(None);
    }
    let mut message = rx.split_to(size);
    let body = message.split_off(codec::HEADER_LEN);
    Ok(Some((header, body)))
}

/// ERR messages end the connection; anything else out of place is a protocol error
fn unexpected_message(message_type: &[u8; 3], body: &[u8]) -> BenchError {
    if message_type == b"ERR" {
        let (status, reason) = codec::parse_error_message(body);
        BenchError::connection(format!("server closed the channel: {} {}", status, reason))
    } else {
        codec::codec_error(format!(
            "unexpected {} message",
            String::from_utf8_lossy(message_type)
        ))
    }
}
