//! Client and listener talking over an in-process duplex stream

use fe2o3_amqp_types::messaging::Outcome;
use hematite_amqp::{
    acceptor::{AcceptedLink, ConnectionAcceptor, LinkAcceptor, ListenerSessionHandle, SessionAcceptor},
    connection::Connection,
    link::{receiver::Receiver, sender::Sender},
    session::Session,
};

const BUF_SIZE: usize = 64 * 1024;

async fn accept_one_session(
    server_io: tokio::io::DuplexStream,
) -> (
    hematite_amqp::acceptor::ListenerConnectionHandle,
    ListenerSessionHandle,
) {
    let acceptor = ConnectionAcceptor::new("listener");
    let mut listener_connection = acceptor.accept(server_io).await.unwrap();

    let incoming = listener_connection.next_incoming_session().await.unwrap();
    let listener_session = SessionAcceptor::new()
        .accept(incoming, &mut listener_connection)
        .await
        .unwrap();
    (listener_connection, listener_session)
}

#[tokio::test]
async fn connection_open_and_close() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let acceptor_handle = tokio::spawn(async move {
        let acceptor = ConnectionAcceptor::new("listener");
        acceptor.accept(server_io).await
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut listener_connection = acceptor_handle.await.unwrap().unwrap();

    // populated once the Open frames have been exchanged
    assert!(connection.remote_max_frame_size().await.is_some());

    connection.close().await.unwrap();
    listener_connection.on_close().await.unwrap();
}

#[tokio::test]
async fn closing_an_already_closed_connection_is_an_error() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let acceptor_handle = tokio::spawn(async move {
        let acceptor = ConnectionAcceptor::new("listener");
        acceptor.accept(server_io).await
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut listener_connection = acceptor_handle.await.unwrap().unwrap();

    connection.close().await.unwrap();
    assert!(matches!(
        connection.close().await,
        Err(hematite_amqp::connection::Error::IllegalState)
    ));

    listener_connection.on_close().await.unwrap();
}

#[tokio::test]
async fn session_begin_and_end() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(async move {
        let acceptor = ConnectionAcceptor::new("listener");
        let mut listener_connection = acceptor.accept(server_io).await.unwrap();

        let incoming = listener_connection.next_incoming_session().await.unwrap();
        // Set the windows and answer the Begin right away; deferring the
        // answer would reject the peer's endpoint
        let mut listener_session = SessionAcceptor::new()
            .incoming_window(10_000)
            .accept(incoming, &mut listener_connection)
            .await
            .unwrap();

        listener_session.on_end().await.unwrap();
        listener_connection.on_close().await.unwrap();
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_with_stream(client_io)
        .await
        .unwrap();

    let mut session = Session::begin(&mut connection).await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn rejected_incoming_session_fails_the_client_begin() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(async move {
        let acceptor = ConnectionAcceptor::new("listener");
        let mut listener_connection = acceptor.accept(server_io).await.unwrap();

        // Dropping the incoming session instead of answering its Begin
        // rejects the peer's endpoint with a connection level error
        let incoming = listener_connection.next_incoming_session().await.unwrap();
        drop(incoming);
        let _ = listener_connection.on_close().await;
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_with_stream(client_io)
        .await
        .unwrap();

    let result = Session::begin(&mut connection).await;
    assert!(result.is_err());

    server.await.unwrap();
}

#[tokio::test]
async fn message_transfer_with_disposition() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(async move {
        let (mut listener_connection, mut listener_session) = accept_one_session(server_io).await;

        let endpoint = listener_session.next_incoming_link().await.unwrap();
        let link_acceptor = LinkAcceptor {
            auto_accept: true,
            ..Default::default()
        };
        let mut receiver = match link_acceptor
            .accept(endpoint, &mut listener_session)
            .await
            .unwrap()
        {
            AcceptedLink::Receiver(receiver) => receiver,
            AcceptedLink::Sender(_) => panic!("expected a receiving endpoint"),
        };

        let delivery = receiver.recv::<String>().await.unwrap();
        assert_eq!(delivery.body(), "hello AMQP");

        receiver.close().await.unwrap();
        listener_session.on_end().await.unwrap();
        listener_connection.on_close().await.unwrap();
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let mut sender = Sender::attach(&mut session, "test-sender", "test-queue")
        .await
        .unwrap();

    let outcome = sender.send("hello AMQP".to_string()).await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));

    sender.close().await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn large_message_is_split_and_reassembled() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let body = "abcdefgh".repeat(4096); // 32 KiB, well above the frame size
    let expected = body.clone();

    let server = tokio::spawn(async move {
        let (mut listener_connection, mut listener_session) = accept_one_session(server_io).await;

        let endpoint = listener_session.next_incoming_link().await.unwrap();
        let link_acceptor = LinkAcceptor {
            auto_accept: true,
            ..Default::default()
        };
        let mut receiver = match link_acceptor
            .accept(endpoint, &mut listener_session)
            .await
            .unwrap()
        {
            AcceptedLink::Receiver(receiver) => receiver,
            AcceptedLink::Sender(_) => panic!("expected a receiving endpoint"),
        };

        let delivery = receiver.recv::<String>().await.unwrap();
        assert_eq!(delivery.body(), &expected);

        receiver.close().await.unwrap();
        listener_session.on_end().await.unwrap();
        listener_connection.on_close().await.unwrap();
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .max_frame_size(1024u32)
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let mut sender = Sender::attach(&mut session, "large-sender", "test-queue")
        .await
        .unwrap();

    let outcome = sender.send(body).await.unwrap();
    assert!(matches!(outcome, Outcome::Accepted(_)));

    sender.close().await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn receiver_attaches_and_receives_from_listener_sender() {
    let (client_io, server_io) = tokio::io::duplex(BUF_SIZE);

    let server = tokio::spawn(async move {
        let (mut listener_connection, mut listener_session) = accept_one_session(server_io).await;

        let endpoint = listener_session.next_incoming_link().await.unwrap();
        let mut sender = match LinkAcceptor::new()
            .accept(endpoint, &mut listener_session)
            .await
            .unwrap()
        {
            AcceptedLink::Sender(sender) => sender,
            AcceptedLink::Receiver(_) => panic!("expected a sending endpoint"),
        };

        let outcome = sender.send("from the listener".to_string()).await.unwrap();
        assert!(matches!(outcome, Outcome::Accepted(_)));

        sender.close().await.unwrap();
        listener_session.on_end().await.unwrap();
        listener_connection.on_close().await.unwrap();
    });

    let mut connection = Connection::builder()
        .container_id("client")
        .open_with_stream(client_io)
        .await
        .unwrap();
    let mut session = Session::begin(&mut connection).await.unwrap();

    let mut receiver = Receiver::attach(&mut session, "test-receiver", "test-queue")
        .await
        .unwrap();

    let delivery = receiver.recv::<String>().await.unwrap();
    assert_eq!(delivery.body(), "from the listener");
    receiver.accept(&delivery).await.unwrap();

    receiver.close().await.unwrap();
    session.end().await.unwrap();
    connection.close().await.unwrap();

    server.await.unwrap();
}
