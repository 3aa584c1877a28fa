//! Shared helpers for the server integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use girder::error::Error;
use girder::protocol::{FieldHeader, JsonProtocol, MessageHeader, MessageKind, Protocol, WireType};
use girder::server::{Processor, Server};
use girder::transport::{BufferedTransport, TcpServerTransport, TcpTransport, Transport};

/// Echoes the string in field 1 of each call back as the reply.
///
/// A payload of `"boom"` makes processing fail, standing in for a service
/// handler blowing up mid-request.
pub struct EchoProcessor;

#[async_trait]
impl Processor for EchoProcessor {
    async fn process(
        &self,
        input: &mut dyn Protocol,
        output: &mut dyn Protocol,
    ) -> Result<bool, Error> {
        let header = input.read_message_begin().await?;
        input.read_struct_begin().await?;
        let mut text = String::new();
        loop {
            let field = input.read_field_begin().await?;
            if field.is_stop() {
                break;
            }
            match field.id {
                1 => text = input.read_string().await?,
                _ => input.skip(field.wire_type).await?,
            }
            input.read_field_end().await?;
        }
        input.read_struct_end().await?;
        input.read_message_end().await?;

        if text == "boom" {
            return Err(Error::Processor("handler blew up".to_string()));
        }

        output
            .write_message_begin(&MessageHeader {
                name: header.name,
                kind: MessageKind::Reply,
                sequence: header.sequence,
            })
            .await?;
        output.write_struct_begin("echo_result").await?;
        output
            .write_field_begin(&FieldHeader {
                wire_type: WireType::Binary,
                id: 1,
            })
            .await?;
        output.write_string(&text).await?;
        output.write_field_end().await?;
        output.write_field_stop().await?;
        output.write_struct_end().await?;
        output.write_message_end().await?;
        output.flush().await?;
        Ok(true)
    }
}

/// Start an echo server on an ephemeral port; returns the server, its
/// transport, and a handle on the serve task.
pub async fn start_echo_server() -> (
    Arc<Server>,
    Arc<TcpServerTransport>,
    tokio::task::JoinHandle<()>,
) {
    let transport = Arc::new(TcpServerTransport::new("127.0.0.1:0"));
    let server = Arc::new(
        Server::builder(Arc::new(EchoProcessor), Arc::clone(&transport) as _).build(),
    );
    let serving = Arc::clone(&server);
    let handle = tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    wait_until_listening(&transport).await;
    (server, transport, handle)
}

/// Poll until `listen()` has bound a port.
pub async fn wait_until_listening(transport: &TcpServerTransport) -> SocketAddr {
    for _ in 0..100 {
        if let Some(addr) = transport.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not start listening");
}

/// Open a client protocol over a buffered TCP transport.
pub async fn connect(addr: SocketAddr) -> Result<JsonProtocol, Error> {
    let mut tcp = TcpTransport::new(addr.to_string());
    tcp.open().await?;
    Ok(JsonProtocol::new(Box::new(BufferedTransport::new(
        Box::new(tcp),
    ))))
}

/// One full echo call: send `text`, return the reply payload.
pub async fn call_echo(protocol: &mut JsonProtocol, text: &str, sequence: i32) -> Result<String, Error> {
    protocol
        .write_message_begin(&MessageHeader {
            name: "echo".to_string(),
            kind: MessageKind::Call,
            sequence,
        })
        .await?;
    protocol.write_struct_begin("echo_args").await?;
    protocol
        .write_field_begin(&FieldHeader {
            wire_type: WireType::Binary,
            id: 1,
        })
        .await?;
    protocol.write_string(text).await?;
    protocol.write_field_end().await?;
    protocol.write_field_stop().await?;
    protocol.write_struct_end().await?;
    protocol.write_message_end().await?;
    protocol.flush().await?;

    let header = protocol.read_message_begin().await?;
    assert_eq!(header.kind, MessageKind::Reply);
    assert_eq!(header.sequence, sequence);
    protocol.read_struct_begin().await?;
    let field = protocol.read_field_begin().await?;
    assert_eq!(field.id, 1);
    let reply = protocol.read_string().await?;
    protocol.read_field_end().await?;
    assert!(protocol.read_field_begin().await?.is_stop());
    protocol.read_struct_end().await?;
    protocol.read_message_end().await?;
    Ok(reply)
}
