//! Modbus TCP over `tokio::net`

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::frame::{self, MbapHeader, MBAP_HEADER_LEN};
use super::NetworkBus;
use crate::config::Endpoint;
use crate::error::TransportError;

/// An open Modbus TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    endpoint: Endpoint,
    transaction_id: u16,
}

impl TcpConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

/// [`NetworkBus`] speaking Modbus TCP (MBAP framing)
#[derive(Debug, Clone, Default)]
pub struct TcpNetworkBus;

impl TcpNetworkBus {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkBus for TcpNetworkBus {
    type Connection = TcpConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpConnection, TransportError> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;
        debug!(%endpoint, "Connected");
        Ok(TcpConnection {
            stream,
            endpoint: endpoint.clone(),
            transaction_id: 0,
        })
    }

    async fn read_registers(
        &self,
        connection: &mut TcpConnection,
        unit_id: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let transaction_id = connection.next_transaction_id();
        let request = frame::encode_mbap(
            transaction_id,
            unit_id,
            &frame::read_request_pdu(start, count),
        );
        connection.stream.write_all(&request).await?;

        let mut head = [0u8; MBAP_HEADER_LEN];
        connection.stream.read_exact(&mut head).await?;
        let header = MbapHeader::decode(&head)?;

        let mut pdu = vec![0u8; header.pdu_len()];
        connection.stream.read_exact(&mut pdu).await?;

        if header.transaction_id != transaction_id {
            return Err(TransportError::Codec(format!(
                "transaction id mismatch: sent {}, received {}",
                transaction_id, header.transaction_id
            )));
        }
        if header.unit_id != unit_id {
            return Err(TransportError::Codec(format!(
                "response from unit {} while addressing {}",
                header.unit_id, unit_id
            )));
        }
        frame::decode_read_response(&pdu, count)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answer one read request per accepted connection with `values`
    async fn spawn_device(values: Vec<u16>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let mut head = [0u8; MBAP_HEADER_LEN];
                if socket.read_exact(&mut head).await.is_err() {
                    break;
                }
                let header = MbapHeader::decode(&head).unwrap();
                let mut request = vec![0u8; header.pdu_len()];
                socket.read_exact(&mut request).await.unwrap();

                let response = frame::encode_mbap(
                    header.transaction_id,
                    header.unit_id,
                    &frame::read_response_pdu(&values),
                );
                socket.write_all(&response).await.unwrap();
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_read_registers_over_loopback() {
        let endpoint = spawn_device(vec![230, 231]).await;
        let bus = TcpNetworkBus::new();

        let mut conn = bus.connect(&endpoint).await.unwrap();
        assert_eq!(conn.endpoint(), &endpoint);

        let values = bus.read_registers(&mut conn, 1, 100, 2).await.unwrap();
        assert_eq!(values, vec![230, 231]);

        // second transaction on the same connection
        let values = bus.read_registers(&mut conn, 1, 100, 2).await.unwrap();
        assert_eq!(values, vec![230, 231]);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_codec_error() {
        let endpoint = spawn_device(vec![1]).await;
        let bus = TcpNetworkBus::new();
        let mut conn = bus.connect(&endpoint).await.unwrap();

        let err = bus.read_registers(&mut conn, 1, 0, 3).await.unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpNetworkBus::new()
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
