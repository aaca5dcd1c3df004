//! S7 adapter: direct data block access over ISO-on-TCP.
//!
//! Scalar variables map onto fixed offsets of one data block according to their
//! declared type. The bulk block is written and read back as consecutive big-endian
//! LTIME values, split across as many jobs as the negotiated PDU size needs.

pub mod client;
pub mod codec;

use crate::adapter::{measure, ProtocolAdapter, Timed};
use async_trait::async_trait;
use client::S7Client;
use codec::DbAddress;
use plcbench_common::{parse_ltimes, BenchError, PlcValue, Result, S7Config, VariableKind, LTIME_WIDTH_BYTES};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct S7Adapter {
    config: S7Config,
    types: BTreeMap<String, VariableKind>,
    client: Option<S7Client>,
}

impl S7Adapter {
    /// `types` is the declared type table; undeclared variables are treated as bool.
    pub fn new(config: S7Config, types: BTreeMap<String, VariableKind>) -> Self {
        Self {
            config,
            types,
            client: None,
        }
    }

    fn kind_of(&self, variable: &str) -> VariableKind {
        self.types.get(variable).copied().unwrap_or(VariableKind::Bool)
    }

    fn address_for(&self, kind: VariableKind) -> DbAddress {
        let db = self.config.db_number;
        match kind {
            VariableKind::Bool => DbAddress::bit(db, self.config.bool_offset, self.config.bool_bit),
            VariableKind::Int16 => DbAddress::byte(db, self.config.int16_offset),
            VariableKind::Int32 => DbAddress::byte(db, self.config.int32_offset),
            VariableKind::BulkBlock => DbAddress::byte(db, self.config.bulk_offset),
        }
    }

    fn session(&mut self) -> Result<&mut S7Client> {
        self.client
            .as_mut()
            .ok_or_else(|| BenchError::connection("S7 session is not established"))
    }

    /// Drop the session after a connection-level failure so later calls fail fast
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(BenchError::Connection(_)) = &result {
            self.client = None;
        }
        result
    }

    /// Memory image of the bulk block: one element per value, LTIME in the leading bytes
    fn bulk_image(&self, values: &[String]) -> Result<Vec<u8>> {
        let element = self.config.bulk_element_size;
        let ltimes = parse_ltimes(values).map_err(|e| BenchError::operation("s7 bulk", e.to_string()))?;
        let mut image = vec![0u8; ltimes.len() * element];
        for (slot, ltime) in image.chunks_mut(element).zip(&ltimes) {
            let bytes = ltime.to_be_bytes();
            slot[..bytes.len()].copy_from_slice(&bytes);
        }
        Ok(image)
    }
}

#[async_trait]
impl ProtocolAdapter for S7Adapter {
    fn name(&self) -> &str {
        "s7"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let addr = self.config.socket_addr();
        let client = S7Client::connect(&addr, self.config.rack, self.config.slot, self.config.timeout()).await?;
        info!(
            "Connected to S7 CPU at {} (rack {}, slot {}, PDU {})",
            addr,
            self.config.rack,
            self.config.slot,
            client.pdu_length()
        );
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await;
            debug!("S7 session closed");
        }
        Ok(())
    }

    async fn write(&mut self, variable: &str, value: PlcValue) -> Result<Timed> {
        let address = self.address_for(value.kind());
        let session = self.session()?;
        let (result, latency) = measure(async {
            match value {
                PlcValue::Bool(v) => session.write_bit(address, v).await,
                PlcValue::Int16(v) => session.write_bytes(address, &v.to_be_bytes(), 2).await.map(|_| ()),
                PlcValue::Int32(v) => session.write_bytes(address, &v.to_be_bytes(), 4).await.map(|_| ()),
            }
        })
        .await;
        self.settle(result)?;
        Ok(Timed::new(
            json!({ "variable": variable, "db": address.db, "offset": address.byte_offset, "value": value.to_json() }),
            latency,
        ))
    }

    async fn read(&mut self, variable: &str) -> Result<Timed> {
        let kind = self.kind_of(variable);
        if kind.is_bulk() {
            return Err(BenchError::operation("s7 read", "use read_bulk for the bulk block"));
        }
        let address = self.address_for(kind);
        let width = kind.width_bytes();
        let session = self.session()?;
        let (result, latency) = measure(async {
            match kind {
                VariableKind::Bool => session.read_bit(address).await.map(PlcValue::Bool),
                _ => session.read_bytes(address, width as u16).await.and_then(|b| decode_scalar(kind, &b)),
            }
        })
        .await;
        let value = self.settle(result)?;
        Ok(Timed::new(
            json!({ "variable": variable, "value": value.to_json() }),
            latency,
        ))
    }

    async fn write_bulk(&mut self, values: &[String]) -> Result<Timed> {
        let image = self.bulk_image(values)?;
        let address = self.address_for(VariableKind::BulkBlock);
        let element = self.config.bulk_element_size;
        let session = self.session()?;
        let (result, latency) = measure(session.write_bytes(address, &image, element)).await;
        let jobs = self.settle(result)?;
        Ok(Timed::new(
            json!({ "elements": values.len(), "bytes": image.len(), "jobs": jobs }),
            latency,
        ))
    }

    async fn read_bulk(&mut self, entries: usize) -> Result<Timed> {
        let address = self.address_for(VariableKind::BulkBlock);
        let element = self.config.bulk_element_size;
        let session = self.session()?;
        let (result, latency) = measure(session.read_block(address, entries * element, element)).await;
        let (image, jobs) = self.settle(result)?;
        let first = image
            .get(..LTIME_WIDTH_BYTES)
            .and_then(|b| <[u8; LTIME_WIDTH_BYTES]>::try_from(b).ok())
            .map(i64::from_be_bytes);
        Ok(Timed::new(
            json!({ "elements": entries, "bytes": image.len(), "jobs": jobs, "first_ns": first }),
            latency,
        ))
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

/// Big-endian integer of the width `kind` occupies
fn decode_scalar(kind: VariableKind, data: &[u8]) -> Result<PlcValue> {
    if data.len() != kind.width_bytes() {
        return Err(short_read(data, kind.width_bytes()));
    }
    match kind {
        VariableKind::Int16 => Ok(PlcValue::Int16(i16::from_be_bytes([data[0], data[1]]))),
        VariableKind::Int32 => Ok(PlcValue::Int32(i32::from_be_bytes([data[0], data[1], data[2], data[3]]))),
        VariableKind::Bool => Ok(PlcValue::Bool(data[0] & 0x01 != 0)),
        VariableKind::BulkBlock => Err(BenchError::operation("s7 read", "bulk block is not a scalar")),
    }
}

fn short_read(data: &[u8], expected: usize) -> BenchError {
    BenchError::operation(
        "s7 read",
        format!("expected {} bytes, got {}", expected, data.len()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use plcbench_common::ErrorKind;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal CPU: confirms the connection, negotiates PDU 480 and acknowledges jobs
    struct MockCpu {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        /// Byte count of every read job
        reads: Arc<Mutex<Vec<usize>>>,
        addr: String,
    }

    async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.ok()?;
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(len, 0);
        stream.read_exact(&mut frame[4..]).await.ok()?;
        Some(frame)
    }

    fn ack_frame(pdu_ref: [u8; 2], params: &[u8], data: &[u8]) -> Vec<u8> {
        let mut pdu = vec![0x32, 0x03, 0x00, 0x00, pdu_ref[0], pdu_ref[1]];
        pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&(data.len() as u16).to_be_bytes());
        pdu.extend_from_slice(&[0x00, 0x00]);
        pdu.extend_from_slice(params);
        pdu.extend_from_slice(data);
        let total = 7 + pdu.len();
        let mut frame = vec![0x03, 0x00];
        frame.extend_from_slice(&(total as u16).to_be_bytes());
        frame.extend_from_slice(&[0x02, 0xF0, 0x80]);
        frame.extend_from_slice(&pdu);
        frame
    }

    /// `late_first_ack` holds back the second half of the first write acknowledgement
    async fn spawn_cpu(write_return_code: u8, close_after_jobs: Option<usize>, late_first_ack: Option<Duration>) -> MockCpu {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let reads = Arc::new(Mutex::new(Vec::new()));
        let (recorded, read_log) = (writes.clone(), reads.clone());
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut jobs = 0;
            let mut late = late_first_ack;
            while let Some(frame) = read_frame(&mut stream).await {
                if frame[5] == 0xE0 {
                    let mut confirm = frame.clone();
                    confirm[5] = 0xD0;
                    stream.write_all(&confirm).await.unwrap();
                    continue;
                }
                let pdu = &frame[7..];
                let pdu_ref = [pdu[4], pdu[5]];
                let params = &pdu[10..];
                let reply = match params[0] {
                    0xF0 => ack_frame(pdu_ref, &[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0], &[]),
                    0x05 => {
                        jobs += 1;
                        if close_after_jobs == Some(jobs) {
                            return;
                        }
                        recorded.lock().unwrap().push(params[14..].to_vec());
                        ack_frame(pdu_ref, &[0x05, 0x01], &[write_return_code])
                    }
                    _ => {
                        let count = usize::from(u16::from_be_bytes([params[6], params[7]]));
                        let offset = (u32::from_be_bytes([0, params[11], params[12], params[13]]) >> 3) as usize;
                        read_log.lock().unwrap().push(count);
                        let payload: Vec<u8> = if count <= 2 {
                            vec![0x01, 0x2C]
                        } else {
                            (0..count).map(|i| ((offset + i) % 251) as u8).collect()
                        };
                        let mut data = vec![0xFF, 0x04];
                        data.extend_from_slice(&((payload.len() * 8) as u16).to_be_bytes());
                        data.extend_from_slice(&payload);
                        ack_frame(pdu_ref, &[0x04, 0x01], &data)
                    }
                };
                if params[0] == 0x05 {
                    if let Some(delay) = late.take() {
                        stream.write_all(&reply[..10]).await.unwrap();
                        tokio::time::sleep(delay).await;
                        stream.write_all(&reply[10..]).await.unwrap();
                        continue;
                    }
                }
                stream.write_all(&reply).await.unwrap();
            }
        });
        MockCpu { writes, reads, addr }
    }

    fn adapter_for(cpu: &MockCpu) -> S7Adapter {
        adapter_with_timeout(cpu, 2_000)
    }

    fn adapter_with_timeout(cpu: &MockCpu, timeout_ms: u64) -> S7Adapter {
        let (host, port) = cpu.addr.rsplit_once(':').unwrap();
        let config = S7Config {
            address: host.to_string(),
            port: port.parse().unwrap(),
            timeout_ms,
            ..S7Config::default()
        };
        let mut types = BTreeMap::new();
        types.insert("counter".to_string(), VariableKind::Int16);
        S7Adapter::new(config, types)
    }

    #[tokio::test]
    async fn test_scalar_writes_and_read() {
        let cpu = spawn_cpu(0xFF, None, None).await;
        let mut adapter = adapter_for(&cpu);
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());

        adapter.write("flag", PlcValue::Bool(true)).await.unwrap();
        adapter.write("counter", PlcValue::Int16(300)).await.unwrap();
        let read = adapter.read("counter").await.unwrap();
        assert_eq!(read.response["value"], json!(300));

        let writes = cpu.writes.lock().unwrap().clone();
        assert_eq!(writes[0], vec![0x00, 0x03, 0x00, 0x01, 0x01]);
        assert_eq!(writes[1], vec![0x00, 0x04, 0x00, 0x10, 0x01, 0x2C]);

        adapter.disconnect().await.unwrap();
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_bulk_write_is_chunked_on_element_boundaries() {
        let cpu = spawn_cpu(0xFF, None, None).await;
        let mut adapter = adapter_for(&cpu);
        adapter.connect().await.unwrap();

        let values: Vec<String> = (0..100).map(|i| format!("LT#{}ns", i * 1_000_000)).collect();
        let timed = adapter.write_bulk(&values).await.unwrap();
        assert_eq!(timed.response["bytes"], json!(800));
        assert_eq!(timed.response["jobs"], json!(2));

        let writes = cpu.writes.lock().unwrap().clone();
        // 480 byte PDU leaves room for 55 LTIME elements per job
        assert_eq!(writes[0].len() - 4, 440);
        assert_eq!(writes[1].len() - 4, 360);
        // element 1 is 1_000_000 ns, big-endian
        assert_eq!(&writes[0][4 + 8..4 + 16], &1_000_000i64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_bulk_read_is_chunked_on_element_boundaries() {
        let cpu = spawn_cpu(0xFF, None, None).await;
        let mut adapter = adapter_for(&cpu);
        adapter.connect().await.unwrap();

        let timed = adapter.read_bulk(100).await.unwrap();
        assert_eq!(timed.response["bytes"], json!(800));
        assert_eq!(timed.response["jobs"], json!(2));
        // 480 byte PDU returns at most 462 bytes, 57 whole elements
        assert_eq!(*cpu.reads.lock().unwrap(), vec![456, 344]);
    }

    #[tokio::test]
    async fn test_late_reply_does_not_desync_session() {
        let cpu = spawn_cpu(0xFF, None, Some(Duration::from_millis(450))).await;
        let mut adapter = adapter_with_timeout(&cpu, 300);
        adapter.connect().await.unwrap();

        let err = adapter.write("flag", PlcValue::Bool(true)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert!(adapter.is_connected());

        // the rest of the stale acknowledgement lands while this job waits
        adapter.write("counter", PlcValue::Int16(7)).await.unwrap();
        adapter.write("counter", PlcValue::Int16(8)).await.unwrap();
        assert!(adapter.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_write_keeps_session() {
        let cpu = spawn_cpu(0x05, None, None).await;
        let mut adapter = adapter_for(&cpu);
        adapter.connect().await.unwrap();

        let err = adapter.write("counter", PlcValue::Int16(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert!(adapter.is_connected());
    }

    #[tokio::test]
    async fn test_lost_connection_is_fatal() {
        let cpu = spawn_cpu(0xFF, Some(2), None).await;
        let mut adapter = adapter_for(&cpu);
        adapter.connect().await.unwrap();

        adapter.write("flag", PlcValue::Bool(false)).await.unwrap();
        let err = adapter.write("flag", PlcValue::Bool(true)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(!adapter.is_connected());

        let err = adapter.write("flag", PlcValue::Bool(true)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = S7Config {
            address: "127.0.0.1".to_string(),
            port,
            timeout_ms: 1_000,
            ..S7Config::default()
        };
        let mut adapter = S7Adapter::new(config, BTreeMap::new());
        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_malformed_bulk_literal_is_operation_error() {
        let adapter = S7Adapter::new(S7Config::default(), BTreeMap::new());
        let err = adapter.bulk_image(&["5ms".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
    }
}
