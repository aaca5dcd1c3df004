//! OPC UA adapter.
//!
//! Variables are addressed as string node ids in the configured namespace, with the
//! variant type taken from the declared type table. A bulk write sends every
//! element node of the block in one WriteRequest; a bulk read asks for all of them in
//! one ReadRequest.

pub mod client;
pub mod codec;

use crate::adapter::{measure, ProtocolAdapter, Timed};
use async_trait::async_trait;
use client::UaClient;
use codec::{NodeId, StatusCode, Variant};
use plcbench_common::{parse_ltimes, BenchError, OpcUaConfig, PlcValue, Result, VariableKind};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub struct OpcUaAdapter {
    config: OpcUaConfig,
    types: BTreeMap<String, VariableKind>,
    bulk_variable: String,
    client: Option<UaClient>,
}

impl OpcUaAdapter {
    pub fn new(config: OpcUaConfig, types: BTreeMap<String, VariableKind>, bulk_variable: impl Into<String>) -> Self {
        Self {
            config,
            types,
            bulk_variable: bulk_variable.into(),
            client: None,
        }
    }

    fn node(&self, variable: &str) -> NodeId {
        NodeId::string(self.config.namespace_index, variable)
    }

    /// Variant for `value` as the server expects it for `variable`
    fn variant_for(&self, variable: &str, value: PlcValue) -> Result<Variant> {
        let declared = self.types.get(variable).copied().unwrap_or(value.kind());
        match (declared, value) {
            (VariableKind::Bool, PlcValue::Bool(v)) => Ok(Variant::Boolean(v)),
            (VariableKind::Int16, PlcValue::Int16(v)) => Ok(Variant::Int16(v)),
            (VariableKind::Int16, PlcValue::Int32(v)) => i16::try_from(v)
                .map(Variant::Int16)
                .map_err(|_| BenchError::operation("opc ua write", format!("{} does not fit Int16", v))),
            (VariableKind::Int32, PlcValue::Int16(v)) => Ok(Variant::Int32(i32::from(v))),
            (VariableKind::Int32, PlcValue::Int32(v)) => Ok(Variant::Int32(v)),
            (declared, value) => Err(BenchError::operation(
                "opc ua write",
                format!("{} is declared {} but got {} value {}", variable, declared, value.kind(), value),
            )),
        }
    }

    fn session(&mut self) -> Result<&mut UaClient> {
        self.client
            .as_mut()
            .ok_or_else(|| BenchError::connection("OPC UA session is not established"))
    }

    /// Node of element `index` of the bulk block
    fn bulk_node(&self, index: usize) -> NodeId {
        NodeId::string(self.config.namespace_index, format!("{}[{}]", self.bulk_variable, index))
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(BenchError::Connection(_)) = &result {
            self.client = None;
        }
        result
    }
}

fn first_bad(statuses: &[StatusCode]) -> Option<(usize, StatusCode)> {
    statuses
        .iter()
        .copied()
        .enumerate()
        .find(|(_, status)| !status.is_good())
}

#[async_trait]
impl ProtocolAdapter for OpcUaAdapter {
    fn name(&self) -> &str {
        "opc_ua"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = UaClient::connect(
            &self.config.endpoint_url,
            &self.config.anonymous_policy_id,
            Duration::from_millis(self.config.session_timeout_ms),
            self.config.timeout(),
        )
        .await?;
        info!("Connected to OPC UA server at {}", self.config.endpoint_url);
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await;
            debug!("OPC UA session closed");
        }
        Ok(())
    }

    async fn write(&mut self, variable: &str, value: PlcValue) -> Result<Timed> {
        let items = [(self.node(variable), self.variant_for(variable, value)?)];
        let session = self.session()?;
        let (result, latency) = measure(session.write(&items)).await;
        let statuses = self.settle(result)?;
        if let Some((_, status)) = first_bad(&statuses) {
            return Err(BenchError::operation(
                "opc ua write",
                format!("{} rejected: {}", variable, status),
            ));
        }
        Ok(Timed::new(
            json!({ "node": items[0].0.to_string(), "status": "good" }),
            latency,
        ))
    }

    async fn read(&mut self, variable: &str) -> Result<Timed> {
        let nodes = [self.node(variable)];
        let session = self.session()?;
        let (result, latency) = measure(session.read(&nodes)).await;
        let values = self.settle(result)?;
        let value = values
            .into_iter()
            .next()
            .ok_or_else(|| BenchError::operation("opc ua read", "server returned no values"))?;
        if !value.status.is_good() {
            return Err(BenchError::operation(
                "opc ua read",
                format!("{} unreadable: {}", variable, value.status),
            ));
        }
        Ok(Timed::new(
            json!({ "node": nodes[0].to_string(), "value": value.value.to_json() }),
            latency,
        ))
    }

    async fn write_bulk(&mut self, values: &[String]) -> Result<Timed> {
        let ltimes = parse_ltimes(values).map_err(|e| BenchError::operation("opc ua bulk", e.to_string()))?;
        let items: Vec<(NodeId, Variant)> = ltimes
            .iter()
            .enumerate()
            .map(|(i, ltime)| (self.bulk_node(i), Variant::Int64(ltime.as_nanos())))
            .collect();
        let session = self.session()?;
        let (result, latency) = measure(session.write(&items)).await;
        let statuses = self.settle(result)?;
        if let Some((index, status)) = first_bad(&statuses) {
            let rejected = statuses.iter().filter(|s| !s.is_good()).count();
            return Err(BenchError::operation(
                "opc ua bulk",
                format!(
                    "{} of {} elements rejected, first at index {}: {}",
                    rejected,
                    statuses.len(),
                    index,
                    status
                ),
            ));
        }
        Ok(Timed::new(json!({ "elements": items.len(), "status": "good" }), latency))
    }

    async fn read_bulk(&mut self, entries: usize) -> Result<Timed> {
        let nodes: Vec<NodeId> = (0..entries).map(|i| self.bulk_node(i)).collect();
        let session = self.session()?;
        let (result, latency) = measure(session.read(&nodes)).await;
        let values = self.settle(result)?;
        if values.len() != entries {
            return Err(BenchError::operation(
                "opc ua bulk read",
                format!("asked for {} elements, got {}", entries, values.len()),
            ));
        }
        let statuses: Vec<StatusCode> = values.iter().map(|v| v.status).collect();
        if let Some((index, status)) = first_bad(&statuses) {
            return Err(BenchError::operation(
                "opc ua bulk read",
                format!("element {} unreadable: {}", index, status),
            ));
        }
        Ok(Timed::new(
            json!({ "elements": values.len(), "first": values[0].value.to_json() }),
            latency,
        ))
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::codec::{type_id, Decoder, Encoder, SecureChannel};
    use super::*;
    use plcbench_common::ErrorKind;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CHANNEL: SecureChannel = SecureChannel {
        channel_id: 5,
        token_id: 1,
        revised_lifetime_ms: 3_600_000,
    };

    /// Requests the mock server saw, as (service type id, item count)
    type Seen = Arc<Mutex<Vec<(u32, usize)>>>;

    async fn read_message(stream: &mut TcpStream) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.ok()?;
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut body = vec![0u8; size - 8];
        stream.read_exact(&mut body).await.ok()?;
        Some((header[..3].to_vec(), body))
    }

    fn response(type_id: u32, status: u32) -> Encoder {
        let mut e = Encoder::new();
        e.node_id(&NodeId::numeric(type_id))
            .i64(0)
            .u32(1)
            .u32(status)
            .u8(0)
            .i32(-1)
            .empty_extension_object();
        e
    }

    /// Service type and item count of a request body, skipping its request header
    fn inspect_request(body: &[u8]) -> (u32, usize) {
        let mut d = Decoder::new(body);
        let type_id = match d.node_id().unwrap() {
            NodeId::Numeric { id, .. } => id,
            other => panic!("unexpected type id {}", other),
        };
        d.node_id().unwrap();
        d.i64().unwrap();
        d.u32().unwrap();
        d.u32().unwrap();
        d.string().unwrap();
        d.u32().unwrap();
        d.skip_extension_object().unwrap();
        let count = match type_id {
            type_id::WRITE_REQUEST => d.i32().unwrap() as usize,
            type_id::READ_REQUEST => {
                d.f64().unwrap();
                d.u32().unwrap();
                d.i32().unwrap() as usize
            }
            _ => 0,
        };
        (type_id, count)
    }

    async fn spawn_server(write_status: u32) -> (String, Seen) {
        spawn_server_with(write_status, None).await
    }

    /// `late_first_read` holds back the tail of the first read response
    async fn spawn_server_with(write_status: u32, late_first_read: Option<Duration>) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("opc.tcp://{}", listener.local_addr().unwrap());
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seq = 1;
            let mut late = late_first_read;
            while let Some((kind, body)) = read_message(&mut stream).await {
                let mut split = None;
                let reply = match kind.as_slice() {
                    b"HEL" => {
                        let mut e = Encoder::new();
                        e.bytes(b"ACKF").u32(28).u32(0).u32(65_535).u32(65_535).u32(0).u32(0);
                        e.into_bytes()
                    }
                    b"OPN" => {
                        let mut e = Encoder::new();
                        e.u32(CHANNEL.channel_id)
                            .string(Some(codec::SECURITY_POLICY_NONE))
                            .i32(-1)
                            .i32(-1)
                            .u32(1)
                            .u32(1);
                        let mut r = response(type_id::OPEN_SECURE_CHANNEL_RESPONSE, 0);
                        r.u32(0)
                            .u32(CHANNEL.channel_id)
                            .u32(CHANNEL.token_id)
                            .i64(0)
                            .u32(CHANNEL.revised_lifetime_ms)
                            .i32(-1);
                        e.bytes(&r.into_bytes());
                        let body = e.into_bytes();
                        let mut framed = Encoder::new();
                        framed.bytes(b"OPNF").u32(8 + body.len() as u32).bytes(&body);
                        framed.into_bytes()
                    }
                    b"MSG" => {
                        let (chunk, payload) = codec::parse_chunk(&body).unwrap();
                        let (service, count) = inspect_request(payload);
                        record.lock().unwrap().push((service, count));
                        let reply = match service {
                            type_id::CREATE_SESSION_REQUEST => {
                                let mut r = response(type_id::CREATE_SESSION_RESPONSE, 0);
                                r.node_id(&NodeId::Numeric { namespace: 1, id: 77 })
                                    .node_id(&NodeId::Opaque { namespace: 0, id: vec![9, 9] })
                                    .f64(60_000.0);
                                r
                            }
                            type_id::ACTIVATE_SESSION_REQUEST => response(type_id::ACTIVATE_SESSION_RESPONSE, 0),
                            type_id::WRITE_REQUEST => {
                                let mut r = response(type_id::WRITE_RESPONSE, 0);
                                r.i32(count as i32);
                                for _ in 0..count {
                                    r.u32(write_status);
                                }
                                r.i32(-1);
                                r
                            }
                            type_id::READ_REQUEST => {
                                split = late.take();
                                let mut r = response(type_id::READ_RESPONSE, 0);
                                r.i32(count as i32);
                                for _ in 0..count {
                                    r.u8(0x01).variant(&Variant::Int32(123_456));
                                }
                                r.i32(-1);
                                r
                            }
                            _ => response(type_id::CLOSE_SESSION_RESPONSE, 0),
                        };
                        seq += 1;
                        codec::symmetric(b"MSG", &CHANNEL, seq, chunk.request_id, &reply.into_bytes())
                    }
                    _ => return,
                };
                if let Some(delay) = split {
                    stream.write_all(&reply[..12]).await.unwrap();
                    tokio::time::sleep(delay).await;
                    stream.write_all(&reply[12..]).await.unwrap();
                    continue;
                }
                stream.write_all(&reply).await.unwrap();
            }
        });
        (url, seen)
    }

    fn adapter(url: String) -> OpcUaAdapter {
        let config = OpcUaConfig {
            endpoint_url: url,
            timeout_ms: 2_000,
            ..OpcUaConfig::default()
        };
        let mut types = BTreeMap::new();
        types.insert("\"DB\".counter".to_string(), VariableKind::Int32);
        OpcUaAdapter::new(config, types, "\"DB\".Bulk")
    }

    #[tokio::test]
    async fn test_session_write_read_and_close() {
        let (url, seen) = spawn_server(0).await;
        let mut adapter = adapter(url);
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());

        let timed = adapter.write("\"DB\".flag", PlcValue::Bool(true)).await.unwrap();
        assert_eq!(timed.response["node"], json!("ns=3;s=\"DB\".flag"));

        let read = adapter.read("\"DB\".counter").await.unwrap();
        assert_eq!(read.response["value"], json!(123_456));

        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());

        let services: Vec<u32> = seen.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            services,
            vec![
                type_id::CREATE_SESSION_REQUEST,
                type_id::ACTIVATE_SESSION_REQUEST,
                type_id::WRITE_REQUEST,
                type_id::READ_REQUEST,
                type_id::CLOSE_SESSION_REQUEST,
            ]
        );
    }

    #[tokio::test]
    async fn test_bulk_write_is_one_request() {
        let (url, seen) = spawn_server(0).await;
        let mut adapter = adapter(url);
        adapter.connect().await.unwrap();

        let values: Vec<String> = (0..100).map(|i| format!("LT#{}ns", i * 1_000_000)).collect();
        let timed = adapter.write_bulk(&values).await.unwrap();
        assert_eq!(timed.response["elements"], json!(100));

        let writes: Vec<usize> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == type_id::WRITE_REQUEST)
            .map(|(_, n)| *n)
            .collect();
        assert_eq!(writes, vec![100]);
    }

    #[tokio::test]
    async fn test_bulk_read_is_one_request() {
        let (url, seen) = spawn_server(0).await;
        let mut adapter = adapter(url);
        adapter.connect().await.unwrap();

        let timed = adapter.read_bulk(100).await.unwrap();
        assert_eq!(timed.response["elements"], json!(100));
        let reads: Vec<usize> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == type_id::READ_REQUEST)
            .map(|(_, n)| *n)
            .collect();
        assert_eq!(reads, vec![100]);
    }

    #[tokio::test]
    async fn test_late_response_is_discarded_not_misframed() {
        let (url, _) = spawn_server_with(0, Some(Duration::from_millis(450))).await;
        let mut a = adapter(url);
        a.config.timeout_ms = 300;
        a.connect().await.unwrap();

        let err = a.read("\"DB\".counter").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert!(a.is_connected());

        a.write("\"DB\".flag", PlcValue::Bool(true)).await.unwrap();
        let read = a.read("\"DB\".counter").await.unwrap();
        assert_eq!(read.response["value"], json!(123_456));
    }

    #[tokio::test]
    async fn test_bad_write_status_is_operation_error() {
        let (url, _) = spawn_server(0x803B_0000).await;
        let mut adapter = adapter(url);
        adapter.connect().await.unwrap();

        let err = adapter.write("\"DB\".flag", PlcValue::Bool(false)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert!(err.to_string().contains("BadNotWritable"));
        assert!(adapter.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("opc.tcp://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut adapter = adapter(url);
        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        let err = adapter.read("\"DB\".flag").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_variant_follows_declared_type() {
        let adapter = adapter("opc.tcp://localhost:4840".to_string());
        assert_eq!(
            adapter.variant_for("\"DB\".counter", PlcValue::Int16(5)).unwrap(),
            Variant::Int32(5)
        );
        assert_eq!(
            adapter.variant_for("\"DB\".undeclared", PlcValue::Int16(5)).unwrap(),
            Variant::Int16(5)
        );
        assert!(adapter.variant_for("\"DB\".counter", PlcValue::Bool(true)).is_err());
    }
}
