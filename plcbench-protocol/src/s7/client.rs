use super::codec::{self, DbAddress, TransportSize};
use bytes::BytesMut;
use plcbench_common::{BenchError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

fn lost(err: std::io::Error) -> BenchError {
    BenchError::connection(format!("S7 connection lost: {}", err))
}

/// One ISO-on-TCP session with a CPU
pub struct S7Client {
    stream: TcpStream,
    /// Bytes received but not yet consumed as a frame; survives a timed-out wait
    rx: BytesMut,
    pdu_length: u16,
    next_ref: u16,
    timeout: Duration,
}

impl S7Client {
    /// Open the TCP connection, negotiate COTP and the S7 PDU size.
    ///
    /// Every failure here is a connection error.
    pub async fn connect(addr: &str, rack: u16, slot: u16, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BenchError::connection(format!("timed out connecting to {}", addr)))?
            .map_err(|e| BenchError::connection(format!("failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).map_err(lost)?;

        let mut client = Self {
            stream,
            rx: BytesMut::with_capacity(usize::from(codec::REQUESTED_PDU_LENGTH) * 2),
            pdu_length: codec::REQUESTED_PDU_LENGTH,
            next_ref: 1,
            timeout,
        };
        client.handshake(rack, slot).await.map_err(|e| match e {
            BenchError::Connection(msg) => BenchError::Connection(msg),
            other => BenchError::connection(format!("S7 handshake failed: {}", other)),
        })?;
        debug!("S7 session with {} negotiated PDU length {}", addr, client.pdu_length);
        Ok(client)
    }

    async fn handshake(&mut self, rack: u16, slot: u16) -> Result<()> {
        self.send(&codec::connection_request(rack, slot)).await?;
        let timeout = self.timeout;
        let confirm = tokio::time::timeout(timeout, self.recv_frame())
            .await
            .map_err(|_| BenchError::connection("S7 peer did not confirm the connection"))??;
        codec::check_connection_confirm(&confirm)?;

        let pdu_ref = self.allocate_ref();
        let response = self
            .transact(codec::setup_communication(pdu_ref, codec::REQUESTED_PDU_LENGTH), pdu_ref)
            .await?;
        self.pdu_length = codec::parse_setup_response(&response)?;
        if usize::from(self.pdu_length) <= codec::WRITE_OVERHEAD {
            return Err(BenchError::connection(format!(
                "negotiated PDU length {} is too small",
                self.pdu_length
            )));
        }
        Ok(())
    }

    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    /// Largest payload a single write-var job can carry, rounded down to `align`
    pub fn max_write_payload(&self, align: usize) -> usize {
        let raw = usize::from(self.pdu_length).saturating_sub(codec::WRITE_OVERHEAD);
        let align = align.max(1);
        (raw / align * align).max(align)
    }

    /// Largest payload a single read-var job can return, rounded down to `align`
    pub fn max_read_payload(&self, align: usize) -> usize {
        let raw = usize::from(self.pdu_length).saturating_sub(codec::READ_OVERHEAD);
        let align = align.max(1);
        (raw / align * align).max(align)
    }

    pub async fn write_bit(&mut self, address: DbAddress, value: bool) -> Result<()> {
        let pdu_ref = self.allocate_ref();
        let frame = codec::write_request(pdu_ref, address, TransportSize::Bit, &[u8::from(value)]);
        let response = self.transact(frame, pdu_ref).await?;
        codec::parse_write_response(&response)
    }

    /// Write `data` starting at `address`, split across as many jobs as the PDU requires.
    /// Chunk boundaries fall on multiples of `align`.
    pub async fn write_bytes(&mut self, address: DbAddress, data: &[u8], align: usize) -> Result<usize> {
        let chunk_size = self.max_write_payload(align);
        let mut jobs = 0;
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let offset = address.byte_offset + (index * chunk_size) as u32;
            let pdu_ref = self.allocate_ref();
            let frame = codec::write_request(pdu_ref, DbAddress::byte(address.db, offset), TransportSize::Byte, chunk);
            let response = self.transact(frame, pdu_ref).await?;
            codec::parse_write_response(&response)?;
            jobs += 1;
        }
        Ok(jobs)
    }

    pub async fn read_bit(&mut self, address: DbAddress) -> Result<bool> {
        let pdu_ref = self.allocate_ref();
        let frame = codec::read_request(pdu_ref, address, TransportSize::Bit, 1);
        let response = self.transact(frame, pdu_ref).await?;
        let data = codec::parse_read_response(&response)?;
        Ok(data.first().is_some_and(|b| b & 0x01 != 0))
    }

    pub async fn read_bytes(&mut self, address: DbAddress, count: u16) -> Result<Vec<u8>> {
        let pdu_ref = self.allocate_ref();
        let frame = codec::read_request(pdu_ref, address, TransportSize::Byte, count);
        let response = self.transact(frame, pdu_ref).await?;
        codec::parse_read_response(&response)
    }

    /// Read `len` bytes starting at `address` in PDU-sized jobs.
    /// Returns the data and the number of jobs it took.
    pub async fn read_block(&mut self, address: DbAddress, len: usize, align: usize) -> Result<(Vec<u8>, usize)> {
        let chunk_size = self.max_read_payload(align);
        let mut data = Vec::with_capacity(len);
        let mut jobs = 0;
        while data.len() < len {
            let want = chunk_size.min(len - data.len());
            let offset = address.byte_offset + data.len() as u32;
            let chunk = self.read_bytes(DbAddress::byte(address.db, offset), want as u16).await?;
            if chunk.len() != want {
                return Err(BenchError::operation(
                    "s7 read",
                    format!("expected {} bytes at offset {}, got {}", want, offset, chunk.len()),
                ));
            }
            data.extend_from_slice(&chunk);
            jobs += 1;
        }
        Ok((data, jobs))
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("S7 shutdown: {}", e);
        }
    }

    fn allocate_ref(&mut self) -> u16 {
        let pdu_ref = self.next_ref;
        self.next_ref = self.next_ref.wrapping_add(1).max(1);
        pdu_ref
    }

    /// Send a job and wait for the acknowledgement carrying the same PDU reference
    async fn transact(&mut self, frame: bytes::BytesMut, pdu_ref: u16) -> Result<Vec<u8>> {
        self.send(&frame).await?;
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.recv_pdu(pdu_ref)).await {
            Ok(result) => result,
            Err(_) => Err(BenchError::operation(
                "s7",
                format!("no response within {:?}", timeout),
            )),
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await.map_err(lost)
    }

    async fn recv_pdu(&mut self, pdu_ref: u16) -> Result<Vec<u8>> {
        loop {
            let frame = self.recv_frame().await?;
            let pdu = codec::s7_payload(&frame)?;
            match codec::pdu_reference(pdu) {
                Some(r) if r == pdu_ref => return Ok(pdu.to_vec()),
                other => debug!("discarding stale S7 PDU (ref {:?}, waiting for {})", other, pdu_ref),
            }
        }
    }

    /// Next complete TPKT frame. Partial frames stay buffered, so dropping this
    /// future on a timeout leaves the stream in sync.
    async fn recv_frame(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(frame) = split_frame(&mut self.rx)? {
                return Ok(frame);
            }
            let read = self.stream.read_buf(&mut self.rx).await.map_err(lost)?;
            if read == 0 {
                return Err(BenchError::connection("S7 connection closed by peer"));
            }
        }
    }
}

/// Take one whole frame off the front of `rx`, if it has fully arrived
fn split_frame(rx: &mut BytesMut) -> Result<Option<BytesMut>> {
    let Some(header) = rx.get(..codec::TPKT_HEADER_LEN) else {
        return Ok(None);
    };
    let header: [u8; codec::TPKT_HEADER_LEN] = header
        .try_into()
        .map_err(|_| BenchError::connection("S7 stream out of sync"))?;
    let len = codec::frame_length(&header)
        .map_err(|e| BenchError::connection(format!("S7 stream out of sync: {}", e)))?;
    if rx.len() < len {
        rx.reserve(len - rx.len());
        return Ok(None);
    }
    Ok(Some(rx.split_to(len)))
}
