//! Put-token against an in-process mock of the `$cbs` node

use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, Message, Properties},
    primitives::{SimpleValue, Timestamp, Value},
};
use hematite_amqp::{
    acceptor::{AcceptedLink, ConnectionAcceptor, LinkAcceptor, SessionAcceptor},
    connection::Connection,
    session::Session,
};
use hematite_amqp_cbs::{CbsClient, CbsTokenType};

const BUF_SIZE: usize = 64 * 1024;

/// The listener half of the test: accepts the CBS link pair, receives one
/// put-token request and answers it with the given status code.
async fn run_cbs_node(server_io: tokio::io::DuplexStream, status_code: i32) {
    let acceptor = ConnectionAcceptor::new("cbs-node");
    let mut listener_connection = acceptor.accept(server_io).await.unwrap();

    let incoming = listener_connection.next_incoming_session().await.unwrap();
    let mut listener_session = SessionAcceptor::new()
        .accept(incoming, &mut listener_connection)
        .await
        .unwrap();

    // The management client attaches its request link first, then the
    // response link
    let request_endpoint = listener_session.next_incoming_link().await.unwrap();
    let request_acceptor = LinkAcceptor {
        auto_accept: true,
        ..Default::default()
    };
    let accepted = request_acceptor
        .accept(request_endpoint, &mut listener_session)
        .await
        .unwrap();
    let mut request_receiver = match accepted {
        AcceptedLink::Receiver(receiver) => receiver,
        AcceptedLink::Sender(_) => panic!("expected the request link"),
    };

    let response_endpoint = listener_session.next_incoming_link().await.unwrap();
    let mut response_sender = match LinkAcceptor::new()
        .accept(response_endpoint, &mut listener_session)
        .await
        .unwrap()
    {
        AcceptedLink::Sender(sender) => sender,
        AcceptedLink::Receiver(_) => panic!("expected the response link"),
    };

    let delivery = request_receiver.recv::<String>().await.unwrap();
    let message = delivery.message();

    let application_properties = message
        .application_properties
        .as_ref()
        .expect("put-token request must carry application properties");
    assert_eq!(
        application_properties.as_inner().get("operation"),
        Some(&SimpleValue::String("put-token".to_string())),
    );
    assert_eq!(
        application_properties.as_inner().get("type"),
        Some(&SimpleValue::String("jwt".to_string())),
    );
    assert_eq!(
        application_properties.as_inner().get("name"),
        Some(&SimpleValue::String("sb://host/entity".to_string())),
    );

    let request_id = message
        .properties
        .as_ref()
        .and_then(|p| p.message_id.clone())
        .expect("put-token request must carry a message id");

    let mut response_properties = Properties::default();
    response_properties.correlation_id = Some(request_id);
    let response = Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: Some(response_properties),
        application_properties: Some(
            ApplicationProperties::builder()
                .insert("statusCode", SimpleValue::Int(status_code))
                .build(),
        ),
        body: Value::Null,
        footer: None,
    };
    response_sender.send(response).await.unwrap();

    request_receiver.close().await.unwrap();
    response_sender.close().await.unwrap();
    listener_session.on_end().await.unwrap();
    listener_connection.on_close().await.unwrap();
}

#[tokio::test]
async fn put_token_succeeds_on_a_2xx_status() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(run_cbs_node(server_io, 200));

    let mut connection = Connection::builder()
        .container_id("cbs-test-client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let mut cbs_client = CbsClient::attach(&mut session).await.unwrap();
    cbs_client
        .put_token(
            CbsTokenType::Jwt,
            "sb://host/entity",
            "<token>",
            Some(Timestamp::from_milliseconds(1_700_003_600_000)),
        )
        .await
        .unwrap();

    cbs_client.close().await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn put_token_surfaces_a_non_2xx_status() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(run_cbs_node(server_io, 401));

    let mut connection = Connection::builder()
        .container_id("cbs-test-client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let mut cbs_client = CbsClient::attach(&mut session).await.unwrap();
    let result = cbs_client
        .put_token(
            CbsTokenType::Jwt,
            "sb://host/entity",
            "<token>",
            None,
        )
        .await;

    match result {
        Err(hematite_amqp_cbs::error::Error::Mgmt(
            hematite_amqp_cbs::error::MgmtError::Status(status),
        )) => {
            assert_eq!(status.code.0.get(), 401);
        }
        other => panic!("expected a status error, got {:?}", other),
    }

    cbs_client.close().await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn sas_token_type_is_rejected_without_io() {
    // No peer at all: the stream is dropped right away, so any frame the
    // client tried to send would fail the operation
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(run_cbs_node(server_io, 200));

    let mut connection = Connection::builder()
        .container_id("cbs-test-client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();
    let mut cbs_client = CbsClient::attach(&mut session).await.unwrap();

    let result = cbs_client
        .put_token(CbsTokenType::Sas, "sb://host/entity", "<token>", None)
        .await;
    assert!(matches!(
        result,
        Err(hematite_amqp_cbs::error::Error::UnsupportedTokenType(
            CbsTokenType::Sas
        ))
    ));

    // The node never saw a request; it is still waiting for one, so tear
    // the transport down instead of the orderly handshakes
    drop(cbs_client);
    drop(session);
    drop(connection);
    server.abort();
    let _ = server.await;
}
