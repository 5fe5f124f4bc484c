//! The management client: a request link and a response link attached to a
//! management node

use fe2o3_amqp_types::{
    definitions::Fields,
    messaging::{FromBody, Message, MessageId, Outcome, Properties},
};
use hematite_amqp::{session::SessionHandle, Delivery, Receiver, Sender};

use crate::{
    error::{AttachError, Error, StatusError},
    request::Request,
    response::{take_status, Response},
    DEFAULT_CLIENT_NODE_ADDRESS, MANAGEMENT_NODE_ADDRESS,
};

/// A client for a management node.
///
/// Requests go out on the request link addressed at the management node;
/// responses come back on the response link targeted at the client node
/// address and are correlated by message id.
#[derive(Debug)]
pub struct MgmtClient {
    req_id: u64,
    last_message_id: Option<MessageId>,
    client_node_addr: String,
    sender: Sender,
    receiver: Receiver,
}

impl MgmtClient {
    /// Creates a builder for a [`MgmtClient`]
    pub fn builder() -> MgmtClientBuilder {
        MgmtClientBuilder::default()
    }

    /// Attaches a management client on the session with the default node
    /// addresses
    pub async fn attach<R>(
        session: &mut SessionHandle<R>,
        client_node_addr: impl Into<String>,
    ) -> Result<Self, AttachError> {
        Self::builder()
            .client_node_addr(client_node_addr)
            .attach(session)
            .await
    }

    /// Detaches both links
    pub async fn close(self) -> Result<(), Error> {
        self.sender.close().await?;
        self.receiver.close().await?;
        Ok(())
    }

    /// Sends a request, stamping the message id and reply-to address.
    ///
    /// Returns the delivery outcome reported by the management node.
    pub async fn send_request(&mut self, request: impl Request) -> Result<Outcome, Error> {
        let mut message = request.into_message();

        let properties = message.properties.get_or_insert(Properties::default());
        let message_id = properties
            .message_id
            .get_or_insert_with(|| {
                let message_id = MessageId::from(self.req_id);
                self.req_id = self.req_id.wrapping_add(1);
                message_id
            })
            .clone();
        self.last_message_id = Some(message_id);
        properties
            .reply_to
            .get_or_insert(self.client_node_addr.clone());

        self.sender.send(message).await.map_err(Error::Send)
    }

    /// Receives and decodes the response to the previously sent request.
    ///
    /// The response delivery is accepted, correlated back to the request
    /// and judged by its status code: anything outside the 2xx window is
    /// returned as a status error carrying the code and description.
    pub async fn recv_response<Res>(&mut self) -> Result<Res, Error>
    where
        Res: Response,
        for<'de> Res::Body: FromBody<'de> + std::fmt::Debug + Send,
    {
        let delivery: Delivery<Res::Body> = self.receiver.recv().await?;
        self.receiver.accept(&delivery).await?;

        let mut message = delivery.into_message();
        self.correlate(&message)?;

        let (status_code, status_description) = take_status(&mut message)?;
        if !status_code.is_success() {
            return Err(StatusError {
                code: status_code,
                description: status_description,
            }
            .into());
        }

        Res::from_message(message)
    }

    /// Sends a request and receives its response
    pub async fn call<Req, Res>(&mut self, request: Req) -> Result<Res, Error>
    where
        Req: Request<Response = Res>,
        Res: Response,
        for<'de> Res::Body: FromBody<'de> + std::fmt::Debug + Send,
    {
        let outcome = self.send_request(request).await?;
        let _accepted = outcome.accepted_or_else(Error::NotAccepted)?;
        self.recv_response().await
    }

    /// The correlation-id of the response MUST be the message-id of the
    /// request; requests are sent one at a time, so the expected id is the
    /// last one stamped
    fn correlate<B>(&self, message: &Message<B>) -> Result<(), Error> {
        let expected = self
            .last_message_id
            .as_ref()
            .ok_or(Error::CorrelationMismatch)?;
        let correlation = message
            .properties
            .as_ref()
            .and_then(|p| p.correlation_id.as_ref())
            .ok_or(Error::CorrelationIdAndMessageIdAreNone)?;

        match correlation == expected {
            true => Ok(()),
            false => Err(Error::CorrelationMismatch),
        }
    }
}

/// Builder for a [`MgmtClient`]
#[derive(Debug)]
pub struct MgmtClientBuilder {
    mgmt_node_addr: String,
    client_node_addr: String,
    sender_properties: Option<Fields>,
    receiver_properties: Option<Fields>,
}

impl Default for MgmtClientBuilder {
    fn default() -> Self {
        MgmtClientBuilder {
            mgmt_node_addr: String::from(MANAGEMENT_NODE_ADDRESS),
            client_node_addr: String::from(DEFAULT_CLIENT_NODE_ADDRESS),
            sender_properties: None,
            receiver_properties: None,
        }
    }
}

impl MgmtClientBuilder {
    /// Sets the attach properties of the request link
    pub fn sender_properties(mut self, properties: Fields) -> Self {
        self.sender_properties = Some(properties);
        self
    }

    /// Sets the attach properties of the response link
    pub fn receiver_properties(mut self, properties: Fields) -> Self {
        self.receiver_properties = Some(properties);
        self
    }

    /// Sets the address of the management node
    pub fn management_node_address(mut self, mgmt_node_addr: impl Into<String>) -> Self {
        self.mgmt_node_addr = mgmt_node_addr.into();
        self
    }

    /// Sets the address of the client node
    pub fn client_node_addr(mut self, client_node_addr: impl Into<String>) -> Self {
        self.client_node_addr = client_node_addr.into();
        self
    }

    /// Attaches the request and response links on the session
    pub async fn attach<R>(
        self,
        session: &mut SessionHandle<R>,
    ) -> Result<MgmtClient, AttachError> {
        let mut sender_builder = Sender::builder()
            .name(format!("{}-mgmt-sender", self.client_node_addr))
            .target(&self.mgmt_node_addr[..]);
        if let Some(properties) = self.sender_properties {
            sender_builder = sender_builder.properties(properties);
        }
        let sender = sender_builder
            .attach(session)
            .await
            .map_err(AttachError::Sender)?;

        let mut receiver_builder = Receiver::builder()
            .name(format!("{}-mgmt-receiver", self.client_node_addr))
            .source(&self.mgmt_node_addr[..])
            .target(&self.client_node_addr[..]);
        if let Some(properties) = self.receiver_properties {
            receiver_builder = receiver_builder.properties(properties);
        }
        let receiver = receiver_builder
            .attach(session)
            .await
            .map_err(AttachError::Receiver)?;

        Ok(MgmtClient {
            req_id: 0,
            last_message_id: None,
            client_node_addr: self.client_node_addr,
            sender,
            receiver,
        })
    }
}
