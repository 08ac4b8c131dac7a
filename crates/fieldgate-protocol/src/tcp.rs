//! Framed TCP protocol handler: the reference codec over a real socket.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use fieldgate_core::{
    DeviceConfig, ProtocolError, ProtocolKind, Result, TagDef, TagValue, TransportError,
};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::frame::{
    decode_value, encode_value, parse_address, register_count, AddressSpace, Frame, FrameCodec,
    OpCode,
};

/// Handler for devices speaking the length-prefixed framed TCP protocol.
pub struct FramedTcpHandler {
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl FramedTcpHandler {
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
        }
    }
}

#[async_trait]
impl crate::handler::ProtocolHandler for FramedTcpHandler {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::FramedTcp
    }

    async fn connect(
        &self,
        device: &DeviceConfig,
    ) -> Result<Box<dyn crate::handler::ProtocolSession>> {
        let unit_id = device
            .params
            .get("unit")
            .map(|raw| {
                raw.parse::<u8>().map_err(|_| {
                    fieldgate_core::ConfigError::invalid_value(
                        "device.params.unit",
                        format!("'{raw}' is not a unit id"),
                    )
                })
            })
            .transpose()?
            .unwrap_or(1);

        let addr = format!("{}:{}", device.host, device.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportError::timeout("connect", self.connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| {
                TransportError::connect_failed(device.host.clone(), device.port, e.to_string())
            })?;
        stream.set_nodelay(true).ok();

        debug!(device_id = %device.id, address = %addr, "Framed TCP session established");

        Ok(Box::new(TcpSession {
            framed: Framed::new(stream, FrameCodec::new()),
            unit_id,
            next_txn: 1,
            call_timeout: self.call_timeout,
        }))
    }
}

struct TcpSession {
    framed: Framed<TcpStream, FrameCodec>,
    unit_id: u8,
    next_txn: u16,
    call_timeout: Duration,
}

impl TcpSession {
    /// Sends one request and awaits its matching response under the
    /// per-call deadline.
    async fn round_trip(&mut self, operation: &str, op: OpCode, payload: Bytes) -> Result<Frame> {
        let txn_id = self.next_txn;
        self.next_txn = self.next_txn.wrapping_add(1).max(1);
        let request = Frame::request(txn_id, self.unit_id, op, payload);

        let call_timeout = self.call_timeout;
        let framed = &mut self.framed;
        let fut = async move {
            framed.send(request).await?;
            let response = framed
                .next()
                .await
                .ok_or(TransportError::ConnectionClosed {
                    reason: "peer closed the stream mid-request".to_string(),
                })??;
            Ok::<Frame, fieldgate_core::GatewayError>(response)
        };
        let response: Frame = tokio::time::timeout(call_timeout, fut)
            .await
            .map_err(|_| TransportError::timeout(operation, call_timeout.as_millis() as u64))??;

        if response.txn_id != txn_id {
            return Err(ProtocolError::TransactionMismatch {
                expected: txn_id,
                actual: response.txn_id,
            }
            .into());
        }
        if let Some(code) = response.exception {
            return Err(ProtocolError::DeviceException {
                operation: operation.to_string(),
                code,
            }
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl crate::handler::ProtocolSession for TcpSession {
    async fn read_value(&mut self, tag: &TagDef) -> Result<TagValue> {
        let (space, offset) = parse_address(&tag.address)?;
        let count = register_count(tag.data_type);

        let mut payload = BytesMut::with_capacity(4);
        payload.put_u16(offset);
        payload.put_u16(count);

        let response = self
            .round_trip("read_value", space.read_op(), payload.freeze())
            .await?;

        let body = response.payload.as_ref();
        let byte_count = *body.first().ok_or_else(|| {
            ProtocolError::malformed("read response with empty payload")
        })? as usize;
        if byte_count != count as usize * 2 || body.len() != byte_count + 1 {
            return Err(ProtocolError::malformed(format!(
                "read response declares {byte_count} bytes, carried {}",
                body.len().saturating_sub(1)
            ))
            .into());
        }
        Ok(decode_value(&body[1..], tag.data_type)?)
    }

    async fn write_value(&mut self, tag: &TagDef, value: &TagValue) -> Result<()> {
        let (space, offset) = parse_address(&tag.address)?;
        if space == AddressSpace::Input {
            return Err(ProtocolError::UnsupportedOperation {
                operation: format!("write to input register '{}'", tag.address),
            }
            .into());
        }
        let data = encode_value(value, tag.data_type)?;

        let mut payload = BytesMut::with_capacity(3 + data.len());
        payload.put_u16(offset);
        payload.put_u8(data.len() as u8);
        payload.extend_from_slice(&data);

        self.round_trip("write_value", OpCode::WriteSingle, payload.freeze())
            .await?;
        Ok(())
    }

    async fn identify(&mut self) -> Result<String> {
        let response = self
            .round_trip("identify", OpCode::Identify, Bytes::new())
            .await?;
        let text = std::str::from_utf8(&response.payload).map_err(|e| {
            ProtocolError::malformed(format!("identification is not UTF-8: {e}"))
        })?;
        Ok(text.to_string())
    }

    async fn probe(&mut self) -> bool {
        self.identify().await.is_ok()
    }

    async fn close(&mut self) -> Result<()> {
        self.framed.get_mut().shutdown().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ProtocolHandler;
    use fieldgate_core::{DataType, GatewayError};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    fn device(port: u16) -> DeviceConfig {
        DeviceConfig {
            id: "plc-1".to_string(),
            protocol: ProtocolKind::FramedTcp,
            host: "127.0.0.1".to_string(),
            port,
            params: HashMap::new(),
            tags: vec![],
        }
    }

    fn float_tag(address: &str) -> TagDef {
        TagDef {
            name: "line-temp".to_string(),
            address: address.to_string(),
            data_type: DataType::Float,
            writable: true,
            unit: None,
            description: None,
        }
    }

    /// Accepts one connection and answers each request with `respond`.
    async fn spawn_peer<F>(respond: F) -> u16
    where
        F: Fn(Frame) -> Option<Frame> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            while let Some(Ok(request)) = framed.next().await {
                match respond(request) {
                    Some(reply) => framed.send(reply).await.unwrap(),
                    None => break,
                }
            }
        });
        port
    }

    #[tokio::test]
    async fn read_value_round_trips() {
        let port = spawn_peer(|request| {
            let mut payload = BytesMut::new();
            payload.put_u8(4);
            payload.extend_from_slice(&25.5f32.to_be_bytes());
            Some(Frame {
                txn_id: request.txn_id,
                unit_id: request.unit_id,
                op: request.op,
                exception: None,
                payload: payload.freeze(),
            })
        })
        .await;

        let handler = FramedTcpHandler::new(Duration::from_secs(1), Duration::from_secs(1));
        let mut session = handler.connect(&device(port)).await.unwrap();
        let value = session.read_value(&float_tag("40001")).await.unwrap();
        assert_eq!(value, TagValue::Float(25.5));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn device_exception_maps_to_protocol_error() {
        let port = spawn_peer(|request| {
            Some(Frame {
                txn_id: request.txn_id,
                unit_id: request.unit_id,
                op: request.op,
                exception: Some(0x02),
                payload: Bytes::from_static(&[0x02]),
            })
        })
        .await;

        let handler = FramedTcpHandler::new(Duration::from_secs(1), Duration::from_secs(1));
        let mut session = handler.connect(&device(port)).await.unwrap();
        let err = session.read_value(&float_tag("40001")).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::DeviceException { code: 0x02, .. })
        ));
    }

    #[tokio::test]
    async fn silent_peer_times_out_as_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let handler = FramedTcpHandler::new(Duration::from_secs(1), Duration::from_millis(100));
        let mut session = handler.connect(&device(port)).await.unwrap();
        let err = session.read_value(&float_tag("40001")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(
            err,
            GatewayError::Transport(TransportError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn write_to_input_register_is_unsupported() {
        let port = spawn_peer(|_| None).await;
        let handler = FramedTcpHandler::new(Duration::from_secs(1), Duration::from_secs(1));
        let mut session = handler.connect(&device(port)).await.unwrap();
        let err = session
            .write_value(&float_tag("30001"), &TagValue::Float(1.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Protocol(ProtocolError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let handler = FramedTcpHandler::new(Duration::from_millis(500), Duration::from_secs(1));
        // Bind-then-drop to get a port nothing is listening on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = handler.connect(&device(port)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
