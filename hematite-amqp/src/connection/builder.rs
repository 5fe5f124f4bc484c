//! Builder for [`crate::connection::Connection`]

use std::{marker::PhantomData, time::Duration};

use fe2o3_amqp_types::{
    definitions::{Fields, Milliseconds, MIN_MAX_FRAME_SIZE},
    performatives::{ChannelMax, MaxFrameSize, Open},
    primitives::Symbol,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use url::Url;

use crate::{
    connection::{Connection, ConnectionState},
    sasl_profile::SaslProfile,
    transport::{protocol_header::ProtocolHeader, Transport},
};

use super::{
    engine::ConnectionEngine, ConnectionHandle, OpenError, DEFAULT_CONTROL_CHAN_BUF,
    DEFAULT_OUTGOING_BUFFER_SIZE,
};

/// Type state markers for the connection builder
pub mod mode {
    /// The builder does not have a container id yet; a random one is
    /// generated unless the user supplies one
    #[derive(Debug)]
    pub struct WithoutContainerId {}

    /// The builder carries a user supplied container id
    #[derive(Debug)]
    pub struct WithContainerId {}
}

/// Builder for a [`Connection`]
#[derive(Debug, Clone)]
pub struct Builder<Mode> {
    /// The id of the source container
    pub container_id: String,

    /// The name of the target host
    pub hostname: Option<String>,

    /// Proposed maximum frame size
    pub max_frame_size: MaxFrameSize,

    /// The maximum channel number that can be used on the connection
    pub channel_max: ChannelMax,

    /// Idle time-out in milliseconds
    pub idle_time_out: Option<Milliseconds>,

    /// Extension capabilities the sender supports
    pub offered_capabilities: Option<Vec<Symbol>>,

    /// Extension capabilities the sender can use if the receiver supports
    /// them
    pub desired_capabilities: Option<Vec<Symbol>>,

    /// Connection properties
    pub properties: Option<Fields>,

    /// Buffer size of the channel carrying outgoing session frames
    pub buffer_size: usize,

    /// SASL profile for the security layer negotiation
    pub sasl_profile: Option<SaslProfile>,

    marker: PhantomData<Mode>,
}

impl Default for Builder<mode::WithoutContainerId> {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder<mode::WithoutContainerId> {
    /// Creates a new builder with an empty container id
    pub fn new() -> Self {
        Self {
            container_id: String::new(),
            hostname: None,
            max_frame_size: MaxFrameSize(super::DEFAULT_MAX_FRAME_SIZE),
            channel_max: ChannelMax(super::DEFAULT_CHANNEL_MAX),
            idle_time_out: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            buffer_size: DEFAULT_OUTGOING_BUFFER_SIZE,
            sasl_profile: None,
            marker: PhantomData,
        }
    }
}

impl<Mode> Builder<Mode> {
    /// Sets the container id
    pub fn container_id(self, id: impl Into<String>) -> Builder<mode::WithContainerId> {
        Builder::<mode::WithContainerId> {
            container_id: id.into(),
            hostname: self.hostname,
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_time_out: self.idle_time_out,
            offered_capabilities: self.offered_capabilities,
            desired_capabilities: self.desired_capabilities,
            properties: self.properties,
            buffer_size: self.buffer_size,
            sasl_profile: self.sasl_profile,
            marker: PhantomData,
        }
    }

    /// Sets the hostname carried in the Open frame
    pub fn hostname(mut self, hostname: impl Into<Option<String>>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the proposed max frame size; values below 512 are clamped up to
    /// the spec-mandated minimum
    pub fn max_frame_size(mut self, max_frame_size: impl Into<MaxFrameSize>) -> Self {
        let max_frame_size = max_frame_size.into();
        let max_frame_size = std::cmp::max(MIN_MAX_FRAME_SIZE as u32, max_frame_size.0);
        self.max_frame_size = MaxFrameSize::from(max_frame_size);
        self
    }

    /// Sets the channel max
    pub fn channel_max(mut self, channel_max: impl Into<ChannelMax>) -> Self {
        self.channel_max = channel_max.into();
        self
    }

    /// Sets the idle time-out in milliseconds
    pub fn idle_time_out(mut self, idle_time_out: impl Into<Milliseconds>) -> Self {
        self.idle_time_out = Some(idle_time_out.into());
        self
    }

    /// Adds one offered capability
    pub fn add_offered_capabilities(mut self, capability: impl Into<Symbol>) -> Self {
        self.offered_capabilities
            .get_or_insert_with(Vec::new)
            .push(capability.into());
        self
    }

    /// Adds one desired capability
    pub fn add_desired_capabilities(mut self, capability: impl Into<Symbol>) -> Self {
        self.desired_capabilities
            .get_or_insert_with(Vec::new)
            .push(capability.into());
        self
    }

    /// Sets the connection properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Sets the buffer size of the outgoing session frame channel
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the SASL profile used ahead of the AMQP negotiation
    pub fn sasl_profile(mut self, profile: impl Into<SaslProfile>) -> Self {
        self.sasl_profile = Some(profile.into());
        self
    }

    fn into_open(self) -> Open
    where
        Mode: ContainerIdSource,
    {
        Open {
            container_id: Mode::container_id(self.container_id),
            hostname: self.hostname,
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            // To avoid spurious timeouts, the announced idle-time-out SHOULD
            // be half the actual local threshold
            idle_time_out: self.idle_time_out.map(|v| v / 2),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: self.offered_capabilities.map(Into::into),
            desired_capabilities: self.desired_capabilities.map(Into::into),
            properties: self.properties,
        }
    }
}

/// How the container id is derived for each builder mode
pub trait ContainerIdSource {
    /// Resolves the effective container id
    fn container_id(configured: String) -> String;
}

impl ContainerIdSource for mode::WithContainerId {
    fn container_id(configured: String) -> String {
        configured
    }
}

impl ContainerIdSource for mode::WithoutContainerId {
    fn container_id(_: String) -> String {
        // An unset container id defaults to a freshly generated uuid
        format!("hematite-amqp-{}", uuid::Uuid::new_v4())
    }
}

impl<Mode> Builder<Mode>
where
    Mode: ContainerIdSource,
{
    /// Opens a connection to the given url.
    ///
    /// The scheme must be either `amqp` or `amqps`; anything else is
    /// rejected before any IO takes place. A username and password in the
    /// url select SASL PLAIN negotiation.
    pub async fn open(
        mut self,
        url: impl TryInto<Url, Error = url::ParseError>,
    ) -> Result<ConnectionHandle<()>, OpenError> {
        let url: Url = url.try_into()?;

        match url.scheme() {
            "amqp" | "amqps" => {}
            scheme => return Err(OpenError::InvalidScheme(scheme.to_string())),
        }

        self.hostname = url.host_str().map(Into::into);
        if self.sasl_profile.is_none() {
            self.sasl_profile = SaslProfile::try_from(&url).ok();
        }

        match url.scheme() {
            "amqp" => {
                let addrs = url.socket_addrs(|| Some(fe2o3_amqp_types::definitions::PORT))?;
                let stream = TcpStream::connect(&*addrs).await?;
                let hostname = url.host_str().map(ToString::to_string);
                let stream = match self.sasl_profile.take() {
                    Some(profile) => {
                        Transport::connect_sasl(stream, hostname.as_deref(), profile).await?
                    }
                    None => stream,
                };
                self.open_with_stream_inner(stream).await
            }
            // TLS is established by an external connector; hand the
            // negotiated stream to `open_with_stream`
            _ => Err(OpenError::TlsConnectorNotFound),
        }
    }

    /// Opens a connection on an explicitly supplied stream, e.g. an already
    /// established TLS stream.
    ///
    /// Supplying both a stream and a SASL profile is a configuration error:
    /// the profile implies a SASL-derived transport that was not handed
    /// over.
    pub async fn open_with_stream<Io>(self, stream: Io) -> Result<ConnectionHandle<()>, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        if self.sasl_profile.is_some() {
            return Err(OpenError::SaslWithExplicitTransport);
        }
        self.open_with_stream_inner(stream).await
    }

    async fn open_with_stream_inner<Io>(
        self,
        mut stream: Io,
    ) -> Result<ConnectionHandle<()>, OpenError>
    where
        Io: AsyncRead + AsyncWrite + std::fmt::Debug + Send + Unpin + 'static,
    {
        let mut local_state = ConnectionState::Start;
        let _remote_header =
            Transport::negotiate(&mut stream, &mut local_state, ProtocolHeader::amqp()).await?;

        let idle_timeout = self
            .idle_time_out
            .map(|millis| Duration::from_millis(millis as u64));
        let max_frame_size = self.max_frame_size.0 as usize;
        let buffer_size = self.buffer_size;
        let transport = Transport::bind(stream, max_frame_size, idle_timeout);

        let local_open = self.into_open();

        let (control_tx, control_rx) = mpsc::channel(DEFAULT_CONTROL_CHAN_BUF);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(buffer_size);

        let connection = Connection::new(local_state, local_open);
        let engine = ConnectionEngine::open(
            transport,
            connection,
            control_rx,
            control_tx.clone(),
            outgoing_rx,
        )
        .await?;
        let engine_handle = engine.spawn();

        Ok(ConnectionHandle {
            control: control_tx,
            engine_handle: Some(engine_handle),
            outgoing: outgoing_tx,
            session_listener: (),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{mode, Builder, ContainerIdSource};

    #[test]
    fn default_container_id_is_generated() {
        let id = mode::WithoutContainerId::container_id(String::new());
        assert!(id.starts_with("hematite-amqp-"));
        assert_ne!(
            mode::WithoutContainerId::container_id(String::new()),
            mode::WithoutContainerId::container_id(String::new()),
        );
    }

    #[tokio::test]
    async fn invalid_scheme_is_rejected_before_any_io() {
        let result = Builder::new()
            .container_id("test")
            .open("http://localhost:5672")
            .await;
        match result {
            Err(super::OpenError::InvalidScheme(scheme)) => assert_eq!(scheme, "http"),
            _ => panic!("expected InvalidScheme"),
        }
    }

    #[tokio::test]
    async fn sasl_profile_with_explicit_stream_is_a_configuration_error() {
        let (stream, _peer) = tokio::io::duplex(64);
        let result = Builder::new()
            .container_id("test")
            .sasl_profile(crate::sasl_profile::SaslProfile::Anonymous)
            .open_with_stream(stream)
            .await;
        assert!(matches!(
            result,
            Err(super::OpenError::SaslWithExplicitTransport)
        ));
    }
}
