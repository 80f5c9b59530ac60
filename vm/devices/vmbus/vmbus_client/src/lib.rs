// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Client side of the vmbus control protocol: connection and version
//! negotiation, the channel lifecycle, and GPADL registration.
//!
//! All protocol state is owned by a single task spawned by
//! [`VmbusClientBuilder::build`]. [`VmbusClient`] and [`ChannelHandle`] talk
//! to it through request channels.

#![forbid(unsafe_code)]

mod channel;
mod hvsock;
mod rpc;

pub use channel::OpenedChannel;
pub use channel::Rescinded;
pub use channel::SendError;

use channel::ChannelSignal;
use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::future::OptionFuture;
use futures::future::RemoteHandle;
use futures::stream;
use futures::stream::FuturesUnordered;
use futures::stream::SelectAll;
use futures::task::Spawn;
use futures::task::SpawnError;
use futures::task::SpawnExt;
use futures_concurrency::future::Race;
use guid::Guid;
use hvsock::HvsockRequestTracker;
use rpc::Rpc;
use rpc::RpcResponse;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::future::Future;
use std::future::poll_fn;
use std::mem;
use std::pin::Pin;
use std::pin::pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use thiserror::Error;
use vmbus_async::queue;
use vmbus_async::queue::Queue;
use vmbus_async::signal::RawAsyncChannel;
use vmbus_async::signal::RemoteSignal;
use vmbus_core::ContactRequest;
use vmbus_core::HvsockConnectRequest;
use vmbus_core::MonitorPageGpas;
use vmbus_core::OutgoingMessage;
use vmbus_core::VersionInfo;
use vmbus_core::fallback_version;
use vmbus_core::gpadl::GpadlBuffer;
use vmbus_core::gpadl::GpadlError;
use vmbus_core::gpadl::GpadlMessageBuilder;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::OpenChannelFlags;
use vmbus_core::protocol::ParseError;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::Version;
use vmbus_ring::gpadl_ring::GpadlRingError;
use vmbus_ring::gpadl_ring::GpadlRingMem;
use vmbus_ring::gpadl_ring::RingRole;
use vmbus_ring::gpadl_ring::SharedMemory;
use vmbus_ring::gpadl_ring::make_rings;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const SINT: u8 = 2;
const VTL: u8 = 0;

/// The versions the client can negotiate, oldest first.
pub const SUPPORTED_VERSIONS: &[Version] = &[
    Version::Win10,
    Version::Win10Rs3_0,
    Version::Win10Rs3_1,
    Version::Win10Rs4,
    Version::Win10Rs5,
    Version::Iron,
    Version::Copper,
];

/// The feature flags the client knows how to use.
pub const SUPPORTED_FEATURE_FLAGS: FeatureFlags = FeatureFlags::new()
    .with_guest_specified_signal_parameters(true)
    .with_client_id(true);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The client's interface to synic events.
pub trait SynicEventClient: Send + Sync {
    /// Routes incoming signals for `event_flag` to `signal`.
    fn map_event(&self, event_flag: u16, signal: Arc<RemoteSignal>) -> std::io::Result<()>;

    /// Stops routing signals for `event_flag`.
    fn unmap_event(&self, event_flag: u16);

    /// Signals the remote endpoint through `connection_id`.
    fn signal_event(&self, connection_id: u32, event_flag: u16) -> std::io::Result<()>;
}

/// A source of control messages from the remote endpoint.
pub trait VmbusMessageSource: Send {
    /// Receives the next message into `buf` and returns its length. A length
    /// of zero means the source is closed.
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>>;
}

/// The sink for control messages to the remote endpoint.
pub trait PollPostMessage: Send {
    fn poll_post_message(
        &mut self,
        cx: &mut Context<'_>,
        connection_id: u32,
        typ: u32,
        msg: &[u8],
    ) -> Poll<()>;
}

/// A source of timeouts.
pub trait Timer: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Tunables for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The versions to offer, tried newest first.
    pub supported_versions: Vec<Version>,
    /// The features to request when the negotiated version supports them.
    pub feature_flags: FeatureFlags,
    /// How long a handle waits for the remote to answer a request.
    pub request_timeout: Duration,
    /// How long a close waits for the remote to release the channel.
    pub close_timeout: Duration,
    /// The largest control message the transport can carry.
    pub max_message_size: usize,
    /// Whether to request offers after connecting. When false, offers are
    /// only reported as they arrive.
    pub request_offers: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            feature_flags: SUPPORTED_FEATURE_FLAGS,
            request_timeout: DEFAULT_TIMEOUT,
            close_timeout: DEFAULT_TIMEOUT,
            max_message_size: protocol::MAX_MESSAGE_SIZE,
            request_offers: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid maximum message size")]
    InvalidMessageSize(#[source] GpadlError),
    #[error("failed to spawn the client task")]
    Spawn(#[source] SpawnError),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid state to connect to the server")]
    InvalidState,
    #[error("no supported protocol versions")]
    NoSupportedVersions,
    #[error("failed to connect to the server: {0:?}")]
    FailedToConnect(ConnectionState),
    #[error("malformed message from the server")]
    MalformedMessage(#[source] ParseError),
    #[error("the message source closed")]
    ConnectionLost,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("the client task is gone")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("the channel is already open")]
    AlreadyOpen,
    #[error("the channel has been rescinded")]
    ChannelRescinded,
    #[error("gpadl creation failed with status {0:#x}")]
    GpadlCreationFailed(i32),
    #[error("gpadl {0:?} has been torn down")]
    HandleTornDown(GpadlId),
    #[error("gpadl {0:?} is in use")]
    HandleInUse(GpadlId),
    #[error("unknown gpadl {0:?}")]
    UnknownGpadl(GpadlId),
    #[error("gpadl {0:?} is not created on this channel")]
    GpadlNotReady(GpadlId),
    #[error("invalid gpadl")]
    InvalidGpadl(#[source] GpadlError),
    #[error("invalid channel state {0} for the request")]
    InvalidState(&'static str),
    #[error("open failed with status {0:#x}")]
    OpenFailed(u32),
    #[error("timed out waiting for the remote")]
    Timeout,
    #[error("the connection faulted")]
    ConnectionFault,
    #[error("not connected")]
    Disconnected,
    #[error("channel {0:?} has no event flag")]
    NoEventFlag(ChannelId),
    #[error("failed to map the channel event")]
    MapEvent(#[source] std::io::Error),
    #[error("failed to map the ring buffers")]
    Ring(#[source] GpadlRingError),
    #[error("failed to create the channel queue")]
    Queue(#[source] queue::Error),
}

/// Builds a [`VmbusClient`] and spawns its task.
pub struct VmbusClientBuilder {
    event_client: Arc<dyn SynicEventClient>,
    msg_source: Box<dyn VmbusMessageSource>,
    msg_client: Box<dyn PollPostMessage>,
    timer: Arc<dyn Timer>,
    config: ClientConfig,
}

impl VmbusClientBuilder {
    pub fn new(
        event_client: impl SynicEventClient + 'static,
        msg_source: impl VmbusMessageSource + 'static,
        msg_client: impl PollPostMessage + 'static,
        timer: impl Timer + 'static,
    ) -> Self {
        Self {
            event_client: Arc::new(event_client),
            msg_source: Box::new(msg_source),
            msg_client: Box::new(msg_client),
            timer: Arc::new(timer),
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawns the client task on `spawner`.
    pub fn build(self, spawner: &impl Spawn) -> Result<VmbusClient, BuildError> {
        let mut config = self.config;
        config.supported_versions.sort();
        config.supported_versions.dedup();
        let gpadl_builder =
            GpadlMessageBuilder::new(config.max_message_size).map_err(BuildError::InvalidMessageSize)?;

        let (request_send, request_recv) = mpsc::unbounded();
        let timeout = config.request_timeout;
        let mut task = ClientTask {
            config,
            gpadl_builder,
            state: ClientState::Disconnected,
            channels: ChannelList::default(),
            gpadls: GpadlTable::default(),
            messages: OutgoingMessages {
                poster: self.msg_client,
                queued: VecDeque::new(),
            },
            hvsock_tracker: HvsockRequestTracker::new(),
            event_client: self.event_client,
            timer: self.timer.clone(),
            msg_source: self.msg_source,
            client_request_recv: request_recv,
            channel_requests: SelectAll::new(),
            close_timers: FuturesUnordered::new(),
            next_offer_seq: 0,
            next_close_seq: 0,
        };

        let task = spawner
            .spawn_with_handle(async move { task.run().await })
            .map_err(BuildError::Spawn)?;

        Ok(VmbusClient {
            request_send,
            timer: self.timer,
            timeout,
            task,
        })
    }
}

/// The result of a successful connect.
#[derive(Debug)]
pub struct ConnectResult {
    pub version: VersionInfo,
    /// The channels offered before the remote finished delivering offers.
    pub offers: Vec<OfferInfo>,
    /// Channels offered afterwards.
    pub offer_recv: mpsc::UnboundedReceiver<OfferInfo>,
}

/// A channel offered by the remote.
#[derive(Debug)]
pub struct OfferInfo {
    pub offer: protocol::OfferChannel,
    pub handle: ChannelHandle,
    /// Completes when the channel is rescinded or the connection goes away.
    pub revoke_recv: oneshot::Receiver<()>,
    pub rescinded: Rescinded,
}

/// The handle to the client task. Dropping it stops the task.
pub struct VmbusClient {
    request_send: mpsc::UnboundedSender<ClientRequest>,
    timer: Arc<dyn Timer>,
    timeout: Duration,
    task: RemoteHandle<()>,
}

impl VmbusClient {
    /// Connects to the remote, negotiating the newest version both sides
    /// support.
    ///
    /// If this times out, negotiation continues in the task and a later
    /// connect fails with [`ConnectError::InvalidState`] until the client is
    /// disconnected.
    pub async fn connect(
        &mut self,
        target_message_vp: u32,
        monitor_page: Option<MonitorPageGpas>,
        client_id: Guid,
    ) -> Result<ConnectResult, ConnectError> {
        let request = ConnectRequest {
            target_message_vp,
            monitor_page,
            client_id,
        };
        let call = rpc::call(&self.request_send, ClientRequest::Connect, request);
        let timeout = self.timer.sleep(self.timeout);
        match (call.map(Some), timeout.map(|()| None)).race().await {
            Some(Ok(result)) => result,
            Some(Err(rpc::TaskGone)) => Err(ConnectError::Disconnected),
            None => Err(ConnectError::Timeout),
        }
    }

    /// Unloads the connection. Every channel is revoked.
    pub async fn disconnect(&mut self) -> Result<(), ConnectError> {
        rpc::call(&self.request_send, ClientRequest::Disconnect, ())
            .await
            .map_err(|rpc::TaskGone| ConnectError::Disconnected)?
    }

    /// Asks the remote to offer a channel for an hvsocket connection. Returns
    /// `None` if the remote refused.
    pub async fn connect_hvsock(&self, request: HvsockConnectRequest) -> Option<OfferInfo> {
        rpc::call(&self.request_send, ClientRequest::HvsockConnect, request)
            .await
            .ok()
            .flatten()
    }

    /// Stops the client task and waits for it to exit.
    pub async fn shutdown(self) {
        let Self {
            request_send, task, ..
        } = self;
        drop(request_send);
        task.await
    }
}

#[derive(Debug, Copy, Clone)]
struct ConnectRequest {
    target_message_vp: u32,
    monitor_page: Option<MonitorPageGpas>,
    client_id: Guid,
}

enum ClientRequest {
    Connect(Rpc<ConnectRequest, Result<ConnectResult, ConnectError>>),
    Disconnect(Rpc<(), Result<(), ConnectError>>),
    HvsockConnect(Rpc<HvsockConnectRequest, Option<OfferInfo>>),
}

/// Parameters for opening a channel.
#[derive(Debug, Copy, Clone)]
pub struct OpenRequest {
    /// Echoed back by the remote in its open result.
    pub open_id: u32,
    pub target_vp: u32,
    /// A GPADL created on this channel holding both rings.
    pub ring_gpadl_id: GpadlId,
    /// The page at which the opener's receive ring starts.
    pub ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

/// What an open channel needs to set up its data plane.
#[derive(Debug)]
pub struct OpenOutput {
    /// The connection ID to signal the remote on.
    pub connection_id: u32,
    /// The event flag incoming signals arrive on.
    pub event_flag: u16,
    pub ring_gpadl: GpadlBuffer,
    /// Set by the synic when the remote signals the channel.
    pub incoming_signal: Arc<RemoteSignal>,
}

struct GpadlRequest {
    id: Option<GpadlId>,
    buffer: GpadlBuffer,
}

enum ChannelRequest {
    Open(Rpc<OpenRequest, Result<OpenOutput, ChannelError>>),
    Close(Rpc<(), Result<(), ChannelError>>),
    CreateGpadl(Rpc<GpadlRequest, Result<GpadlId, ChannelError>>),
    TeardownGpadl(Rpc<GpadlId, Result<(), ChannelError>>),
}

/// Per-channel requests to the client task. Dropping every clone of the
/// handle closes the channel once it is open.
#[derive(Clone)]
pub struct ChannelHandle {
    channel_id: ChannelId,
    request_send: mpsc::UnboundedSender<ChannelRequest>,
    event_client: Arc<dyn SynicEventClient>,
    rescinded: Rescinded,
    timer: Arc<dyn Timer>,
    request_timeout: Duration,
}

impl Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

impl ChannelHandle {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Sends an open request and waits for the remote's result.
    pub async fn open(&self, request: OpenRequest) -> Result<OpenOutput, ChannelError> {
        self.request(ChannelRequest::Open, request).await
    }

    /// Opens the channel and maps its rings from `mem`.
    pub async fn open_queue<S: SharedMemory>(
        &self,
        mem: &S,
        request: OpenRequest,
    ) -> Result<OpenedChannel<GpadlRingMem<S::Pages>>, ChannelError> {
        let output = self.open(request).await?;
        match self.map_queue(mem, request.ring_buffer_page_offset, output) {
            Ok(queue) => Ok(OpenedChannel::new(
                self.channel_id,
                queue,
                self.rescinded.clone(),
            )),
            Err(err) => {
                // The remote already considers the channel open.
                if let Err(close_err) = self.close().await {
                    tracing::warn!(
                        channel_id = self.channel_id.0,
                        error = &close_err as &dyn std::error::Error,
                        "failed to close channel after ring setup failed"
                    );
                }
                Err(err)
            }
        }
    }

    fn map_queue<S: SharedMemory>(
        &self,
        mem: &S,
        ring_buffer_page_offset: u32,
        output: OpenOutput,
    ) -> Result<Queue<GpadlRingMem<S::Pages>>, ChannelError> {
        let (in_ring, out_ring) = make_rings(
            mem,
            &output.ring_gpadl,
            ring_buffer_page_offset,
            RingRole::Opener,
        )
        .map_err(ChannelError::Ring)?;
        Queue::new(RawAsyncChannel {
            in_ring,
            out_ring,
            signal: Box::new(ChannelSignal {
                event_client: self.event_client.clone(),
                connection_id: output.connection_id,
                incoming: output.incoming_signal,
            }),
        })
        .map_err(ChannelError::Queue)
    }

    /// Closes the channel. Completes once the remote releases it, or after the
    /// close timeout.
    pub async fn close(&self) -> Result<(), ChannelError> {
        rpc::call(&self.request_send, ChannelRequest::Close, ())
            .await
            .map_err(|rpc::TaskGone| ChannelError::Disconnected)?
    }

    /// Registers `buffer` with the remote. If `id` is `None`, an unused
    /// handle is picked.
    pub async fn create_gpadl(
        &self,
        id: Option<GpadlId>,
        buffer: GpadlBuffer,
    ) -> Result<GpadlId, ChannelError> {
        self.request(ChannelRequest::CreateGpadl, GpadlRequest { id, buffer })
            .await
    }

    /// Tears down a GPADL. The handle is not reused for the rest of the
    /// connection.
    pub async fn teardown_gpadl(&self, id: GpadlId) -> Result<(), ChannelError> {
        self.request(ChannelRequest::TeardownGpadl, id).await
    }

    async fn request<I, R>(
        &self,
        f: impl FnOnce(Rpc<I, Result<R, ChannelError>>) -> ChannelRequest,
        input: I,
    ) -> Result<R, ChannelError> {
        let call = rpc::call(&self.request_send, f, input);
        let timeout = self.timer.sleep(self.request_timeout);
        match (call.map(Some), timeout.map(|()| None)).race().await {
            Some(Ok(result)) => result,
            Some(Err(rpc::TaskGone)) => Err(ChannelError::Disconnected),
            None => Err(ChannelError::Timeout),
        }
    }
}

/// Identifies one offer of a channel. Channel IDs are reused by the remote,
/// so requests from an earlier offer's handle must not reach a later one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct ChannelKey {
    channel_id: ChannelId,
    seq: u64,
}

type ChannelRequestStream = Pin<Box<dyn Stream<Item = (ChannelKey, Option<ChannelRequest>)> + Send>>;

struct CloseTimeout {
    channel_id: ChannelId,
    close_seq: u64,
}

enum ClientState {
    Disconnected,
    Negotiating {
        version: Version,
        request: ConnectRequest,
        rpc: RpcResponse<Result<ConnectResult, ConnectError>>,
    },
    RequestingOffers {
        version: VersionInfo,
        rpc: RpcResponse<Result<ConnectResult, ConnectError>>,
        offers: Vec<OfferInfo>,
    },
    Connected {
        version: VersionInfo,
        offer_send: mpsc::UnboundedSender<OfferInfo>,
    },
    Disconnecting {
        version: VersionInfo,
        rpc: RpcResponse<Result<(), ConnectError>>,
    },
}

impl ClientState {
    fn get_version(&self) -> Option<VersionInfo> {
        match self {
            ClientState::Disconnected | ClientState::Negotiating { .. } => None,
            ClientState::RequestingOffers { version, .. }
            | ClientState::Connected { version, .. }
            | ClientState::Disconnecting { version, .. } => Some(*version),
        }
    }
}

impl Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Disconnected => "Disconnected",
            ClientState::Negotiating { .. } => "Negotiating",
            ClientState::RequestingOffers { .. } => "RequestingOffers",
            ClientState::Connected { .. } => "Connected",
            ClientState::Disconnecting { .. } => "Disconnecting",
        };
        f.pad(s)
    }
}

enum ChannelState {
    Offered,
    Opening {
        open_id: u32,
        event_flag: u16,
        signal: Arc<RemoteSignal>,
        ring_gpadl: GpadlBuffer,
        rpc: RpcResponse<Result<OpenOutput, ChannelError>>,
    },
    Open {
        event_flag: u16,
        signal: Arc<RemoteSignal>,
    },
    Closing {
        close_seq: u64,
        rpc: Option<RpcResponse<Result<(), ChannelError>>>,
    },
    Closed,
    Rescinded,
}

impl ChannelState {
    fn name(&self) -> &'static str {
        match self {
            ChannelState::Offered => "Offered",
            ChannelState::Opening { .. } => "Opening",
            ChannelState::Open { .. } => "Open",
            ChannelState::Closing { .. } => "Closing",
            ChannelState::Closed => "Closed",
            ChannelState::Rescinded => "Rescinded",
        }
    }
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

struct Channel {
    offer: protocol::OfferChannel,
    seq: u64,
    state: ChannelState,
    revoke_send: Option<oneshot::Sender<()>>,
    rescinded: Rescinded,
    /// Every handle is gone, so nobody can close the channel.
    handles_dropped: bool,
}

impl Channel {
    fn revoke(&mut self) {
        self.rescinded.set();
        if let Some(send) = self.revoke_send.take() {
            let _ = send.send(());
        }
    }
}

#[derive(Default)]
struct ChannelList {
    channels: HashMap<ChannelId, Channel>,
    /// The first offer sequence number of the current connection.
    first_seq: u64,
}

impl ChannelList {
    fn get_for_request(&mut self, key: ChannelKey) -> Result<&mut Channel, ChannelError> {
        match self.channels.get_mut(&key.channel_id) {
            Some(channel) if channel.seq == key.seq => Ok(channel),
            _ if key.seq < self.first_seq => Err(ChannelError::Disconnected),
            _ => Err(ChannelError::ChannelRescinded),
        }
    }
}

struct GpadlEntry {
    channel_id: ChannelId,
    state: GpadlState,
}

enum GpadlState {
    Pending {
        buffer: GpadlBuffer,
        rpc: RpcResponse<Result<GpadlId, ChannelError>>,
    },
    Created {
        buffer: GpadlBuffer,
    },
    TearingDown {
        rpc: RpcResponse<Result<(), ChannelError>>,
    },
}

/// The GPADLs of the connection. Handles are unique across channels.
struct GpadlTable {
    entries: HashMap<GpadlId, GpadlEntry>,
    /// Handles that have been torn down. They are not reused until the
    /// connection is reset.
    torn_down: HashSet<GpadlId>,
    next_id: u32,
}

impl Default for GpadlTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            torn_down: HashSet::new(),
            next_id: 1,
        }
    }
}

impl GpadlTable {
    fn reserve(&mut self, id: Option<GpadlId>) -> Result<GpadlId, ChannelError> {
        if let Some(id) = id {
            if self.torn_down.contains(&id) {
                return Err(ChannelError::HandleTornDown(id));
            }
            if self.entries.contains_key(&id) {
                return Err(ChannelError::HandleInUse(id));
            }
            return Ok(id);
        }
        loop {
            let id = GpadlId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.entries.contains_key(&id) && !self.torn_down.contains(&id) {
                break Ok(id);
            }
        }
    }

    /// Returns the buffer of a created GPADL that can back the rings of
    /// `channel_id`.
    fn ring_buffer(&self, channel_id: ChannelId, id: GpadlId) -> Result<GpadlBuffer, ChannelError> {
        match self.entries.get(&id) {
            None if self.torn_down.contains(&id) => Err(ChannelError::HandleTornDown(id)),
            None => Err(ChannelError::UnknownGpadl(id)),
            Some(entry) if entry.channel_id != channel_id => Err(ChannelError::GpadlNotReady(id)),
            Some(entry) => match &entry.state {
                GpadlState::Created { buffer } => Ok(buffer.clone()),
                GpadlState::Pending { .. } => Err(ChannelError::GpadlNotReady(id)),
                GpadlState::TearingDown { .. } => Err(ChannelError::HandleTornDown(id)),
            },
        }
    }

    fn has_channel(&self, channel_id: ChannelId) -> bool {
        self.entries
            .values()
            .any(|entry| entry.channel_id == channel_id)
    }
}

struct OutgoingMessages {
    poster: Box<dyn PollPostMessage>,
    queued: VecDeque<OutgoingMessage>,
}

impl OutgoingMessages {
    fn send<T: IntoBytes + protocol::VmbusMessage + Immutable + KnownLayout>(&mut self, msg: &T) {
        self.send_message(OutgoingMessage::new(msg));
    }

    /// Posts `msg` now if nothing is queued ahead of it and the remote has
    /// room, otherwise queues it.
    fn send_message(&mut self, msg: OutgoingMessage) {
        tracing::trace!(typ = ?msg.message_type(), "sending message");
        if self.queued.is_empty() {
            let r = self.poster.poll_post_message(
                &mut Context::from_waker(std::task::Waker::noop()),
                protocol::VMBUS_MESSAGE_REDIRECT_CONNECTION_ID,
                protocol::VMBUS_MESSAGE_TYPE,
                msg.data(),
            );
            if r.is_ready() {
                return;
            }
        }
        tracing::trace!("queueing message");
        self.queued.push_back(msg);
    }

    async fn flush_messages(&mut self) {
        while let Some(msg) = self.queued.front() {
            poll_fn(|cx| {
                self.poster.poll_post_message(
                    cx,
                    protocol::VMBUS_MESSAGE_REDIRECT_CONNECTION_ID,
                    protocol::VMBUS_MESSAGE_TYPE,
                    msg.data(),
                )
            })
            .await;
            tracing::trace!("sent queued message");
            self.queued.pop_front();
        }
    }

    fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

enum Event {
    Message(std::io::Result<usize>),
    Flushed,
    ClientRequest(Option<ClientRequest>),
    ChannelRequest(ChannelKey, Option<ChannelRequest>),
    CloseTimeout(CloseTimeout),
}

struct ClientTask {
    config: ClientConfig,
    gpadl_builder: GpadlMessageBuilder,
    state: ClientState,
    channels: ChannelList,
    gpadls: GpadlTable,
    messages: OutgoingMessages,
    hvsock_tracker: HvsockRequestTracker,
    event_client: Arc<dyn SynicEventClient>,
    timer: Arc<dyn Timer>,
    msg_source: Box<dyn VmbusMessageSource>,
    client_request_recv: mpsc::UnboundedReceiver<ClientRequest>,
    channel_requests: SelectAll<ChannelRequestStream>,
    close_timers: FuturesUnordered<Pin<Box<dyn Future<Output = CloseTimeout> + Send>>>,
    next_offer_seq: u64,
    next_close_seq: u64,
}

impl ClientTask {
    async fn run(&mut self) {
        let mut buf = [0; protocol::MAX_MESSAGE_SIZE];
        loop {
            let event = {
                // Hold off on new requests while the remote is backed up, so
                // the queue of outgoing messages stays bounded.
                let host_backed_up = !self.messages.is_empty();
                let mut message_recv =
                    poll_fn(|cx| self.msg_source.poll_recv(cx, &mut buf)).fuse();
                let mut flush = pin!(OptionFuture::from(
                    host_backed_up.then(|| self.messages.flush_messages().fuse())
                ));
                let mut client_request = OptionFuture::from(
                    (!host_backed_up).then(|| self.client_request_recv.next()),
                );
                let mut channel_request = OptionFuture::from(
                    (!host_backed_up).then(|| self.channel_requests.select_next_some()),
                );
                let mut close_timer = self.close_timers.select_next_some();

                futures::select! {
                    r = message_recv => Event::Message(r),
                    _r = flush => Event::Flushed,
                    r = client_request => match r {
                        Some(request) => Event::ClientRequest(request),
                        None => continue,
                    },
                    r = channel_request => match r {
                        Some((key, request)) => Event::ChannelRequest(key, request),
                        None => continue,
                    },
                    timeout = close_timer => Event::CloseTimeout(timeout),
                }
            };

            match event {
                Event::Message(Ok(0)) => {
                    self.fault(ConnectError::ConnectionLost);
                    break;
                }
                Event::Message(Ok(n)) => self.handle_synic_message(&buf[..n]),
                Event::Message(Err(err)) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to receive message"
                    );
                    self.fault(ConnectError::ConnectionLost);
                    break;
                }
                Event::Flushed => {}
                Event::ClientRequest(Some(request)) => self.handle_client_request(request),
                Event::ClientRequest(None) => {
                    tracing::debug!("client handle dropped, stopping");
                    break;
                }
                Event::ChannelRequest(key, Some(request)) => {
                    self.handle_channel_request(key, request)
                }
                Event::ChannelRequest(key, None) => self.handle_device_removal(key),
                Event::CloseTimeout(timeout) => self.handle_close_timeout(timeout),
            }
        }
    }

    fn handle_client_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Connect(rpc) => self.handle_connect(rpc),
            ClientRequest::Disconnect(rpc) => self.handle_disconnect(rpc),
            ClientRequest::HvsockConnect(rpc) => self.handle_tl_connect(rpc),
        }
    }

    fn handle_channel_request(&mut self, key: ChannelKey, request: ChannelRequest) {
        match request {
            ChannelRequest::Open(rpc) => self.handle_open_channel(key, rpc),
            ChannelRequest::Close(rpc) => self.handle_close_channel(key, rpc),
            ChannelRequest::CreateGpadl(rpc) => self.handle_create_gpadl(key, rpc),
            ChannelRequest::TeardownGpadl(rpc) => self.handle_teardown_gpadl(key, rpc),
        }
    }

    fn handle_connect(&mut self, rpc: Rpc<ConnectRequest, Result<ConnectResult, ConnectError>>) {
        let (request, rpc) = rpc.split();
        if !matches!(self.state, ClientState::Disconnected) {
            tracing::warn!(client_state = %self.state, "connect in invalid state");
            rpc.complete(Err(ConnectError::InvalidState));
            return;
        }
        let Some(&version) = self.config.supported_versions.last() else {
            rpc.complete(Err(ConnectError::NoSupportedVersions));
            return;
        };
        self.initiate_contact(request, version, rpc);
    }

    fn initiate_contact(
        &mut self,
        request: ConnectRequest,
        version: Version,
        rpc: RpcResponse<Result<ConnectResult, ConnectError>>,
    ) {
        let monitor_page = request.monitor_page.unwrap_or_default();
        let contact = ContactRequest {
            version,
            target_message_vp: request.target_message_vp,
            sint: SINT,
            vtl: VTL,
            feature_flags: self.config.feature_flags,
            monitor_page,
            client_id: request.client_id,
        };
        tracing::debug!(%version, feature_flags = ?contact.requested_features(), "initiating contact");
        self.messages.send_message(contact.encode());
        self.state = ClientState::Negotiating {
            version,
            request,
            rpc,
        };
    }

    fn handle_version_response(&mut self, msg: protocol::VersionResponse2) {
        let old_state = mem::replace(&mut self.state, ClientState::Disconnected);
        let ClientState::Negotiating {
            version,
            request,
            rpc,
        } = old_state
        else {
            tracing::warn!(client_state = %old_state, "unexpected version response");
            self.state = old_state;
            return;
        };

        if msg.version_response.version_supported == 0 {
            let Some(next_version) = fallback_version(&self.config.supported_versions, version)
            else {
                tracing::warn!("no supported versions");
                rpc.complete(Err(ConnectError::NoSupportedVersions));
                return;
            };
            tracing::debug!(%version, %next_version, "version rejected, retrying");
            self.initiate_contact(request, next_version, rpc);
            return;
        }

        let connection_state = msg.version_response.connection_state;
        if connection_state != ConnectionState::SUCCESSFUL {
            tracing::warn!(?connection_state, "connection failed");
            rpc.complete(Err(ConnectError::FailedToConnect(connection_state)));
            return;
        }

        let version =
            VersionInfo::accepted(version, self.config.feature_flags, msg.supported_features);

        if self.config.request_offers {
            tracing::info!(?version, "connected, requesting offers");
            self.messages.send(&protocol::RequestOffers {});
            self.state = ClientState::RequestingOffers {
                version,
                rpc,
                offers: Vec::new(),
            };
        } else {
            tracing::info!(?version, "connected");
            let (offer_send, offer_recv) = mpsc::unbounded();
            self.state = ClientState::Connected {
                version,
                offer_send,
            };
            rpc.complete(Ok(ConnectResult {
                version,
                offers: Vec::new(),
                offer_recv,
            }));
        }
    }

    fn handle_offers_delivered(&mut self) {
        let old_state = mem::replace(&mut self.state, ClientState::Disconnected);
        let ClientState::RequestingOffers {
            version,
            rpc,
            offers,
        } = old_state
        else {
            tracing::warn!(client_state = %old_state, "unexpected all offers delivered");
            self.state = old_state;
            return;
        };

        tracing::info!(count = offers.len(), "all offers delivered");
        let (offer_send, offer_recv) = mpsc::unbounded();
        self.state = ClientState::Connected {
            version,
            offer_send,
        };
        rpc.complete(Ok(ConnectResult {
            version,
            offers,
            offer_recv,
        }));
    }

    fn handle_disconnect(&mut self, rpc: Rpc<(), Result<(), ConnectError>>) {
        let ((), rpc) = rpc.split();
        let old_state = mem::replace(&mut self.state, ClientState::Disconnected);
        let ClientState::Connected { version, .. } = old_state else {
            tracing::warn!(client_state = %old_state, "disconnect in invalid state");
            self.state = old_state;
            rpc.complete(Err(ConnectError::InvalidState));
            return;
        };
        tracing::info!("unloading");
        self.messages.send(&protocol::Unload {});
        self.state = ClientState::Disconnecting { version, rpc };
    }

    fn handle_unload_complete(&mut self) {
        let old_state = mem::replace(&mut self.state, ClientState::Disconnected);
        let ClientState::Disconnecting { rpc, .. } = old_state else {
            tracing::warn!(client_state = %old_state, "unexpected unload complete");
            self.state = old_state;
            return;
        };
        tracing::info!("disconnected");
        self.reset_connection(|| ChannelError::Disconnected);
        rpc.complete(Ok(()));
    }

    fn handle_tl_connect(&mut self, rpc: Rpc<HvsockConnectRequest, Option<OfferInfo>>) {
        let version = match &self.state {
            ClientState::Connected { version, .. } if version.version >= Version::Win10 => {
                version.version
            }
            state => {
                tracing::warn!(client_state = %state, "hvsocket connect in invalid state");
                rpc.complete(None);
                return;
            }
        };
        let request = *rpc.input();
        tracing::debug!(?request, "sending hvsocket connect request");
        self.messages.send_message(request.encode(version));
        self.hvsock_tracker.add_request(rpc);
    }

    fn handle_tl_connect_result(&mut self, result: protocol::TlConnectResult) {
        if let Some(rpc) = self.hvsock_tracker.check_result(&result) {
            tracing::debug!(?result, "hvsocket connect request failed");
            rpc.complete(None);
        }
    }

    fn create_channel(&mut self, offer: protocol::OfferChannel) -> OfferInfo {
        let key = ChannelKey {
            channel_id: offer.channel_id,
            seq: self.next_offer_seq,
        };
        self.next_offer_seq += 1;

        let (request_send, request_recv) = mpsc::unbounded();
        let (revoke_send, revoke_recv) = oneshot::channel();
        let rescinded = Rescinded::default();
        self.channels.channels.insert(
            offer.channel_id,
            Channel {
                offer,
                seq: key.seq,
                state: ChannelState::Offered,
                revoke_send: Some(revoke_send),
                rescinded: rescinded.clone(),
                handles_dropped: false,
            },
        );

        // The stream yields `None` once every handle is dropped.
        self.channel_requests.push(Box::pin(
            request_recv
                .map(move |request| (key, Some(request)))
                .chain(stream::once(async move { (key, None) })),
        ));

        OfferInfo {
            offer,
            handle: ChannelHandle {
                channel_id: offer.channel_id,
                request_send,
                event_client: self.event_client.clone(),
                rescinded: rescinded.clone(),
                timer: self.timer.clone(),
                request_timeout: self.config.request_timeout,
            },
            revoke_recv,
            rescinded,
        }
    }

    fn handle_offer(&mut self, offer: protocol::OfferChannel) {
        if !matches!(
            self.state,
            ClientState::RequestingOffers { .. } | ClientState::Connected { .. }
        ) {
            tracing::warn!(client_state = %self.state, "unexpected offer");
            return;
        }

        let channel_id = offer.channel_id.0;
        if self.channels.channels.contains_key(&offer.channel_id) {
            tracing::warn!(channel_id, "duplicate offer, revoking the existing channel");
            self.revoke_channel(offer.channel_id);
            return;
        }

        tracing::info!(
            channel_id,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            subchannel_index = offer.subchannel_index,
            "received offer"
        );

        let info = self.create_channel(offer);
        if let Some(rpc) = self.hvsock_tracker.check_offer(&info.offer) {
            rpc.complete(Some(info));
            return;
        }

        match &mut self.state {
            ClientState::RequestingOffers { offers, .. } => offers.push(info),
            ClientState::Connected { offer_send, .. } => {
                // A dropped receiver drops the offer, which closes its
                // request stream like any other dropped handle.
                let _ = offer_send.unbounded_send(info);
            }
            state => tracing::warn!(client_state = %state, "offer in invalid state"),
        }
    }

    fn handle_rescind(&mut self, rescind: protocol::RescindChannelOffer) {
        let channel_id = rescind.channel_id;
        tracing::info!(channel_id = channel_id.0, "received rescind");
        if !self.channels.channels.contains_key(&channel_id) {
            tracing::warn!(channel_id = channel_id.0, "rescind for unknown channel");
            return;
        }
        self.revoke_channel(channel_id);
    }

    /// Moves a channel to the rescinded state, failing anything that waits on
    /// it. The channel is released once its GPADLs are gone.
    fn revoke_channel(&mut self, channel_id: ChannelId) {
        let Some(channel) = self.channels.channels.get_mut(&channel_id) else {
            return;
        };
        match mem::replace(&mut channel.state, ChannelState::Rescinded) {
            ChannelState::Offered | ChannelState::Closed => {}
            ChannelState::Opening {
                event_flag,
                signal,
                rpc,
                ..
            } => {
                self.event_client.unmap_event(event_flag);
                signal.close();
                rpc.complete(Err(ChannelError::ChannelRescinded));
            }
            ChannelState::Open { event_flag, signal } => {
                self.event_client.unmap_event(event_flag);
                signal.close();
            }
            ChannelState::Closing { rpc, .. } => {
                if let Some(rpc) = rpc {
                    rpc.complete(Err(ChannelError::ChannelRescinded));
                }
            }
            ChannelState::Rescinded => {
                tracing::warn!(channel_id = channel_id.0, "channel already rescinded");
                return;
            }
        }
        channel.revoke();
        self.try_release(channel_id);
    }

    fn try_release(&mut self, channel_id: ChannelId) {
        let Some(channel) = self.channels.channels.get(&channel_id) else {
            return;
        };
        if matches!(channel.state, ChannelState::Rescinded) && !self.gpadls.has_channel(channel_id)
        {
            tracing::debug!(channel_id = channel_id.0, "releasing channel");
            self.messages.send(&protocol::RelIdReleased { channel_id });
            self.channels.channels.remove(&channel_id);
        }
    }

    fn handle_open_channel(
        &mut self,
        key: ChannelKey,
        rpc: Rpc<OpenRequest, Result<OpenOutput, ChannelError>>,
    ) {
        let (request, rpc) = rpc.split();
        let Some(version) = self.state.get_version() else {
            rpc.complete(Err(ChannelError::Disconnected));
            return;
        };
        let channel = match self.channels.get_for_request(key) {
            Ok(channel) => channel,
            Err(err) => {
                rpc.complete(Err(err));
                return;
            }
        };
        match &channel.state {
            ChannelState::Offered | ChannelState::Closed => {}
            ChannelState::Opening { .. } | ChannelState::Open { .. } => {
                rpc.complete(Err(ChannelError::AlreadyOpen));
                return;
            }
            ChannelState::Rescinded => {
                rpc.complete(Err(ChannelError::ChannelRescinded));
                return;
            }
            state @ ChannelState::Closing { .. } => {
                rpc.complete(Err(ChannelError::InvalidState(state.name())));
                return;
            }
        }

        let ring_gpadl = match self
            .gpadls
            .ring_buffer(key.channel_id, request.ring_gpadl_id)
        {
            Ok(buffer) => buffer,
            Err(err) => {
                rpc.complete(Err(err));
                return;
            }
        };

        // Without interrupt redirection the event flag is the channel ID.
        let Ok(event_flag) = u16::try_from(key.channel_id.0) else {
            rpc.complete(Err(ChannelError::NoEventFlag(key.channel_id)));
            return;
        };
        let signal = Arc::new(RemoteSignal::new());
        if let Err(err) = self.event_client.map_event(event_flag, signal.clone()) {
            rpc.complete(Err(ChannelError::MapEvent(err)));
            return;
        }

        tracing::debug!(
            channel_id = key.channel_id.0,
            open_id = request.open_id,
            gpadl_id = request.ring_gpadl_id.0,
            "opening channel"
        );
        let open_channel = protocol::OpenChannel {
            channel_id: key.channel_id,
            open_id: request.open_id,
            ring_buffer_gpadl_id: request.ring_gpadl_id,
            target_vp: request.target_vp,
            downstream_ring_buffer_page_offset: request.ring_buffer_page_offset,
            user_data: request.user_data,
        };
        if version.feature_flags.guest_specified_signal_parameters() {
            self.messages.send(&protocol::OpenChannel2 {
                open_channel,
                connection_id: channel.offer.connection_id,
                event_flag,
                flags: OpenChannelFlags::new(),
            });
        } else {
            self.messages.send(&open_channel);
        }

        channel.state = ChannelState::Opening {
            open_id: request.open_id,
            event_flag,
            signal,
            ring_gpadl,
            rpc,
        };
    }

    fn handle_open_result(&mut self, result: protocol::OpenResult) {
        let channel_id = result.channel_id.0;
        let Some(channel) = self.channels.channels.get_mut(&result.channel_id) else {
            tracing::warn!(channel_id, "open result for unknown channel");
            return;
        };
        if !matches!(&channel.state, ChannelState::Opening { open_id, .. } if *open_id == result.open_id)
        {
            tracing::warn!(
                channel_id,
                open_id = result.open_id,
                channel_state = %channel.state,
                "unexpected open result"
            );
            return;
        }
        let ChannelState::Opening {
            event_flag,
            signal,
            ring_gpadl,
            rpc,
            ..
        } = mem::replace(&mut channel.state, ChannelState::Offered)
        else {
            return;
        };

        if result.status == protocol::STATUS_SUCCESS as u32 {
            tracing::debug!(channel_id, "channel opened");
            channel.state = ChannelState::Open {
                event_flag,
                signal: signal.clone(),
            };
            let handles_dropped = channel.handles_dropped;
            rpc.complete(Ok(OpenOutput {
                connection_id: channel.offer.connection_id,
                event_flag,
                ring_gpadl,
                incoming_signal: signal,
            }));
            if handles_dropped {
                self.start_close(result.channel_id, None);
            }
        } else {
            tracing::debug!(channel_id, status = result.status, "failed to open channel");
            self.event_client.unmap_event(event_flag);
            signal.close();
            rpc.complete(Err(ChannelError::OpenFailed(result.status)));
        }
    }

    fn handle_close_channel(&mut self, key: ChannelKey, rpc: Rpc<(), Result<(), ChannelError>>) {
        let ((), rpc) = rpc.split();
        let channel = match self.channels.get_for_request(key) {
            Ok(channel) => channel,
            Err(err) => {
                rpc.complete(Err(err));
                return;
            }
        };
        match &channel.state {
            ChannelState::Open { .. } => {}
            ChannelState::Rescinded => {
                rpc.complete(Err(ChannelError::ChannelRescinded));
                return;
            }
            state => {
                rpc.complete(Err(ChannelError::InvalidState(state.name())));
                return;
            }
        }
        self.start_close(key.channel_id, Some(rpc));
    }

    /// Sends a close for an open channel and arms its close timer.
    fn start_close(
        &mut self,
        channel_id: ChannelId,
        rpc: Option<RpcResponse<Result<(), ChannelError>>>,
    ) {
        let Some(channel) = self.channels.channels.get_mut(&channel_id) else {
            return;
        };
        let ChannelState::Open { event_flag, signal } = &channel.state else {
            return;
        };
        let (event_flag, signal) = (*event_flag, signal.clone());
        let close_seq = self.next_close_seq;
        self.next_close_seq += 1;
        channel.state = ChannelState::Closing { close_seq, rpc };

        tracing::debug!(channel_id = channel_id.0, "closing channel");
        self.event_client.unmap_event(event_flag);
        signal.close();
        self.messages.send(&protocol::CloseChannel { channel_id });

        let timeout = self.timer.sleep(self.config.close_timeout);
        self.close_timers.push(Box::pin(async move {
            timeout.await;
            CloseTimeout {
                channel_id,
                close_seq,
            }
        }));
    }

    fn handle_close_timeout(&mut self, timeout: CloseTimeout) {
        let Some(channel) = self.channels.channels.get_mut(&timeout.channel_id) else {
            return;
        };
        if !matches!(channel.state, ChannelState::Closing { close_seq, .. } if close_seq == timeout.close_seq)
        {
            return;
        }
        tracing::debug!(
            channel_id = timeout.channel_id.0,
            "timed out waiting for release, closing locally"
        );
        if let ChannelState::Closing { rpc: Some(rpc), .. } =
            mem::replace(&mut channel.state, ChannelState::Closed)
        {
            rpc.complete(Ok(()));
        }
    }

    fn handle_rel_id_released(&mut self, msg: protocol::RelIdReleased) {
        let channel_id = msg.channel_id.0;
        let Some(channel) = self.channels.channels.get_mut(&msg.channel_id) else {
            tracing::warn!(channel_id, "release for unknown channel");
            return;
        };
        if !matches!(channel.state, ChannelState::Closing { .. }) {
            tracing::warn!(channel_id, channel_state = %channel.state, "unexpected release");
            return;
        }
        tracing::debug!(channel_id, "channel closed");
        if let ChannelState::Closing { rpc: Some(rpc), .. } =
            mem::replace(&mut channel.state, ChannelState::Closed)
        {
            rpc.complete(Ok(()));
        }
    }

    /// Every handle for the channel has been dropped.
    fn handle_device_removal(&mut self, key: ChannelKey) {
        let Ok(channel) = self.channels.get_for_request(key) else {
            return;
        };
        channel.handles_dropped = true;
        match channel.state {
            ChannelState::Open { .. } => {
                tracing::warn!(
                    channel_id = key.channel_id.0,
                    "channel handle dropped while open, closing"
                );
                self.start_close(key.channel_id, None);
            }
            ChannelState::Opening { .. } => {
                tracing::warn!(
                    channel_id = key.channel_id.0,
                    "channel handle dropped while opening, closing once open"
                );
            }
            _ => {}
        }
    }

    fn handle_create_gpadl(
        &mut self,
        key: ChannelKey,
        rpc: Rpc<GpadlRequest, Result<GpadlId, ChannelError>>,
    ) {
        let (request, rpc) = rpc.split();
        let channel = match self.channels.get_for_request(key) {
            Ok(channel) => channel,
            Err(err) => {
                rpc.complete(Err(err));
                return;
            }
        };
        if matches!(channel.state, ChannelState::Rescinded) {
            rpc.complete(Err(ChannelError::ChannelRescinded));
            return;
        }
        let gpadl_id = match self.gpadls.reserve(request.id) {
            Ok(id) => id,
            Err(err) => {
                rpc.complete(Err(err));
                return;
            }
        };
        let messages = match self
            .gpadl_builder
            .build(key.channel_id, gpadl_id, &request.buffer)
        {
            Ok(messages) => messages,
            Err(err) => {
                rpc.complete(Err(ChannelError::InvalidGpadl(err)));
                return;
            }
        };

        tracing::debug!(
            channel_id = key.channel_id.0,
            gpadl_id = gpadl_id.0,
            count = messages.len(),
            "creating gpadl"
        );
        for msg in messages {
            self.messages.send_message(msg);
        }
        self.gpadls.entries.insert(
            gpadl_id,
            GpadlEntry {
                channel_id: key.channel_id,
                state: GpadlState::Pending {
                    buffer: request.buffer,
                    rpc,
                },
            },
        );
    }

    fn handle_gpadl_created(&mut self, msg: protocol::GpadlCreated) {
        let gpadl_id = msg.gpadl_id;
        let Some(entry) = self.gpadls.entries.remove(&gpadl_id) else {
            tracing::warn!(gpadl_id = gpadl_id.0, "gpadl created for unknown gpadl");
            return;
        };
        let (channel_id, buffer, rpc) = match entry {
            GpadlEntry {
                channel_id,
                state: GpadlState::Pending { buffer, rpc },
            } if channel_id == msg.channel_id => (channel_id, buffer, rpc),
            entry => {
                tracing::warn!(
                    gpadl_id = gpadl_id.0,
                    channel_id = msg.channel_id.0,
                    "unexpected gpadl created"
                );
                self.gpadls.entries.insert(gpadl_id, entry);
                return;
            }
        };

        if msg.status == protocol::STATUS_SUCCESS {
            tracing::debug!(channel_id = channel_id.0, gpadl_id = gpadl_id.0, "gpadl created");
            self.gpadls.entries.insert(
                gpadl_id,
                GpadlEntry {
                    channel_id,
                    state: GpadlState::Created { buffer },
                },
            );
            rpc.complete(Ok(gpadl_id));
        } else {
            tracing::debug!(
                channel_id = channel_id.0,
                gpadl_id = gpadl_id.0,
                status = msg.status,
                "gpadl creation failed"
            );
            rpc.complete(Err(ChannelError::GpadlCreationFailed(msg.status)));
            self.try_release(channel_id);
        }
    }

    fn handle_teardown_gpadl(
        &mut self,
        key: ChannelKey,
        rpc: Rpc<GpadlId, Result<(), ChannelError>>,
    ) {
        let (gpadl_id, rpc) = rpc.split();
        if let Err(err) = self.channels.get_for_request(key) {
            rpc.complete(Err(err));
            return;
        }
        let entry = match self.gpadls.entries.get_mut(&gpadl_id) {
            Some(entry) if entry.channel_id == key.channel_id => entry,
            None if self.gpadls.torn_down.contains(&gpadl_id) => {
                rpc.complete(Err(ChannelError::HandleTornDown(gpadl_id)));
                return;
            }
            _ => {
                rpc.complete(Err(ChannelError::UnknownGpadl(gpadl_id)));
                return;
            }
        };
        match &entry.state {
            GpadlState::Created { .. } => {}
            GpadlState::Pending { .. } => {
                rpc.complete(Err(ChannelError::GpadlNotReady(gpadl_id)));
                return;
            }
            GpadlState::TearingDown { .. } => {
                rpc.complete(Err(ChannelError::HandleTornDown(gpadl_id)));
                return;
            }
        }

        tracing::debug!(
            channel_id = key.channel_id.0,
            gpadl_id = gpadl_id.0,
            "tearing down gpadl"
        );
        entry.state = GpadlState::TearingDown { rpc };
        self.gpadls.torn_down.insert(gpadl_id);
        self.messages.send(&protocol::GpadlTeardown {
            channel_id: key.channel_id,
            gpadl_id,
        });
    }

    fn handle_gpadl_torndown(&mut self, msg: protocol::GpadlTorndown) {
        let gpadl_id = msg.gpadl_id;
        match self.gpadls.entries.remove(&gpadl_id) {
            Some(GpadlEntry {
                channel_id,
                state: GpadlState::TearingDown { rpc },
            }) => {
                tracing::debug!(
                    channel_id = channel_id.0,
                    gpadl_id = gpadl_id.0,
                    "gpadl torn down"
                );
                rpc.complete(Ok(()));
                self.try_release(channel_id);
            }
            Some(entry) => {
                tracing::warn!(gpadl_id = gpadl_id.0, "gpadl torndown without teardown");
                self.gpadls.entries.insert(gpadl_id, entry);
            }
            None => {
                tracing::warn!(gpadl_id = gpadl_id.0, "gpadl torndown for unknown gpadl");
            }
        }
    }

    fn handle_synic_message(&mut self, data: &[u8]) {
        let msg = match Message::parse(data, self.state.get_version()) {
            Ok(msg) => msg,
            Err(err) => {
                self.fault(ConnectError::MalformedMessage(err));
                return;
            }
        };
        tracing::trace!(?msg, "received message");

        match msg {
            Message::VersionResponse2(msg, ..) => self.handle_version_response(msg),
            Message::VersionResponse(msg, ..) => self.handle_version_response(msg.into()),
            Message::OfferChannel(msg, ..) => self.handle_offer(msg),
            Message::AllOffersDelivered(..) => self.handle_offers_delivered(),
            Message::RescindChannelOffer(msg, ..) => self.handle_rescind(msg),
            Message::OpenResult(msg, ..) => self.handle_open_result(msg),
            Message::GpadlCreated(msg, ..) => self.handle_gpadl_created(msg),
            Message::GpadlTorndown(msg, ..) => self.handle_gpadl_torndown(msg),
            Message::RelIdReleased(msg, ..) => self.handle_rel_id_released(msg),
            Message::UnloadComplete(..) => self.handle_unload_complete(),
            Message::TlConnectResult(msg, ..) => self.handle_tl_connect_result(msg),
            Message::CloseReservedChannelResponse(..) => {
                tracing::warn!("unsupported close reserved channel response")
            }
            Message::RequestOffers(..)
            | Message::OpenChannel2(..)
            | Message::OpenChannel(..)
            | Message::CloseChannel(..)
            | Message::GpadlHeader(..)
            | Message::GpadlBody(..)
            | Message::GpadlTeardown(..)
            | Message::InitiateContact2(..)
            | Message::InitiateContact(..)
            | Message::Unload(..)
            | Message::OpenReservedChannel(..)
            | Message::CloseReservedChannel(..)
            | Message::TlConnectRequest2(..)
            | Message::TlConnectRequest(..) => {
                tracing::warn!(message_type = ?msg.message_type(), "unexpected server-bound message");
            }
        }
    }

    /// Tears down the connection after a fatal error.
    fn fault(&mut self, err: ConnectError) {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            client_state = %self.state,
            "connection fault"
        );
        match mem::replace(&mut self.state, ClientState::Disconnected) {
            ClientState::Negotiating { rpc, .. } | ClientState::RequestingOffers { rpc, .. } => {
                rpc.complete(Err(err))
            }
            ClientState::Disconnecting { rpc, .. } => rpc.complete(Err(err)),
            ClientState::Connected { .. } | ClientState::Disconnected => {}
        }
        self.messages.queued.clear();
        self.reset_connection(|| ChannelError::ConnectionFault);
    }

    /// Drops every channel and GPADL of the connection, failing pending
    /// requests with the error from `err`.
    fn reset_connection(&mut self, err: fn() -> ChannelError) {
        for (_, mut channel) in self.channels.channels.drain() {
            match mem::replace(&mut channel.state, ChannelState::Rescinded) {
                ChannelState::Opening {
                    event_flag,
                    signal,
                    rpc,
                    ..
                } => {
                    self.event_client.unmap_event(event_flag);
                    signal.close();
                    rpc.complete(Err(err()));
                }
                ChannelState::Open { event_flag, signal } => {
                    self.event_client.unmap_event(event_flag);
                    signal.close();
                }
                ChannelState::Closing { rpc, .. } => {
                    if let Some(rpc) = rpc {
                        rpc.complete(Ok(()));
                    }
                }
                ChannelState::Offered | ChannelState::Closed | ChannelState::Rescinded => {}
            }
            channel.revoke();
        }
        self.channels.first_seq = self.next_offer_seq;

        for (_, entry) in mem::take(&mut self.gpadls).entries {
            match entry.state {
                GpadlState::Pending { rpc, .. } => rpc.complete(Err(err())),
                // The remote drops every GPADL along with the connection.
                GpadlState::TearingDown { rpc } => rpc.complete(Ok(())),
                GpadlState::Created { .. } => {}
            }
        }

        self.close_timers.clear();
        self.hvsock_tracker.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;
    use futures_concurrency::future::Join;
    use parking_lot::Mutex;
    use protocol::MessageHeader;
    use protocol::TargetInfo;
    use protocol::VmbusMessage;
    use protocol::make_version;
    use std::task::ready;
    use test_with_tracing::test;
    use vmbus_async::queue::IncomingPacket;
    use vmbus_async::queue::OutgoingPacket;
    use vmbus_async::signal::ChannelClosed;
    use vmbus_async::signal::SignalVmbusChannel;
    use vmbus_core::gpadl::gpadl_buffer_from_pages;
    use vmbus_ring::OutgoingPacketType;
    use vmbus_ring::gpadl_ring::PagePool;
    use zerocopy::FromBytes;

    const VMBUS_TEST_CLIENT_ID: Guid = Guid::from_static_str("e6e6e6e6-e6e6-e6e6-e6e6-e6e6e6e6e6e6");

    fn in_msg<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(t: &T) -> Vec<u8> {
        OutgoingMessage::new(t).data().to_vec()
    }

    #[track_caller]
    fn check_message<T>(msg: OutgoingMessage, chk: T)
    where
        T: IntoBytes + FromBytes + Immutable + KnownLayout + Debug + VmbusMessage,
    {
        let chk_data = OutgoingMessage::new(&chk);
        if msg.data() != chk_data.data() {
            let (header, rest) = MessageHeader::read_from_prefix(msg.data()).unwrap();
            assert_eq!(header.message_type(), <T as VmbusMessage>::MESSAGE_TYPE);
            let (msg, _) = T::read_from_prefix(rest).expect("incorrect message size");
            panic!("mismatched messages, expected {:#?}, got {:#?}", chk, msg);
        }
    }

    /// The version field of an encoded InitiateContact.
    fn requested_version(msg: &OutgoingMessage) -> u32 {
        let (_, rest) = MessageHeader::read_from_prefix(msg.data()).unwrap();
        protocol::InitiateContact::read_from_prefix(rest)
            .unwrap()
            .0
            .version_requested
    }

    /// Lets the client task run until it is idle.
    async fn yield_to_client() {
        let mut yielded = false;
        poll_fn(|cx| {
            if yielded {
                Poll::Ready(())
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        })
        .await
    }

    fn guid(n: u32) -> Guid {
        Guid {
            data1: n,
            ..Guid::ZERO
        }
    }

    fn offer(channel_id: u32) -> protocol::OfferChannel {
        protocol::OfferChannel {
            interface_id: guid(1),
            instance_id: guid(100 + channel_id),
            rsvd: [0; 4],
            flags: protocol::OfferFlags::new(),
            mmio_megabytes: 0,
            user_defined: UserDefinedData::default(),
            subchannel_index: 0,
            mmio_megabytes_optional: 0,
            channel_id: ChannelId(channel_id),
            monitor_id: 0,
            monitor_allocated: 0,
            is_dedicated: 1,
            connection_id: 0x1000 + channel_id,
        }
    }

    fn version_response(supported: bool) -> protocol::VersionResponse2 {
        protocol::VersionResponse2 {
            version_response: protocol::VersionResponse {
                version_supported: supported as u8,
                connection_state: ConnectionState::SUCCESSFUL,
                padding: 0,
                selected_version_or_connection_id: 0,
            },
            supported_features: FeatureFlags::all().into(),
        }
    }

    struct TestPoster(mpsc::UnboundedSender<OutgoingMessage>);

    impl PollPostMessage for TestPoster {
        fn poll_post_message(
            &mut self,
            _cx: &mut Context<'_>,
            connection_id: u32,
            typ: u32,
            msg: &[u8],
        ) -> Poll<()> {
            assert_eq!(connection_id, protocol::VMBUS_MESSAGE_REDIRECT_CONNECTION_ID);
            assert_eq!(typ, protocol::VMBUS_MESSAGE_TYPE);
            let _ = self.0.unbounded_send(OutgoingMessage::from_bytes(msg).unwrap());
            Poll::Ready(())
        }
    }

    struct TestMessageSource(mpsc::UnboundedReceiver<Vec<u8>>);

    impl VmbusMessageSource for TestMessageSource {
        fn poll_recv(
            &mut self,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            match ready!(self.0.poll_next_unpin(cx)) {
                Some(msg) => {
                    buf[..msg.len()].copy_from_slice(&msg);
                    Poll::Ready(Ok(msg.len()))
                }
                None => Poll::Ready(Ok(0)),
            }
        }
    }

    /// Routes channel events in-process. Signals from the client to any
    /// connection land on `host_signal`.
    #[derive(Default)]
    struct TestSynic {
        mapped: Mutex<HashMap<u16, Arc<RemoteSignal>>>,
        host_signal: Arc<RemoteSignal>,
    }

    impl SynicEventClient for Arc<TestSynic> {
        fn map_event(&self, event_flag: u16, signal: Arc<RemoteSignal>) -> std::io::Result<()> {
            self.mapped.lock().insert(event_flag, signal);
            Ok(())
        }

        fn unmap_event(&self, event_flag: u16) {
            self.mapped.lock().remove(&event_flag);
        }

        fn signal_event(&self, _connection_id: u32, _event_flag: u16) -> std::io::Result<()> {
            self.host_signal.on_remote_signal();
            Ok(())
        }
    }

    /// The host end of a channel's signals.
    struct HostSignal {
        synic: Arc<TestSynic>,
        event_flag: u16,
    }

    impl SignalVmbusChannel for HostSignal {
        fn signal_remote(&self) {
            if let Some(signal) = self.synic.mapped.lock().get(&self.event_flag) {
                signal.on_remote_signal();
            }
        }

        fn poll_for_signal(&self, cx: &mut Context<'_>) -> Poll<Result<(), ChannelClosed>> {
            self.synic.host_signal.poll_wait(cx)
        }
    }

    /// A timer whose sleeps only complete when fired.
    #[derive(Clone, Default)]
    struct TestTimer(Arc<Mutex<Vec<oneshot::Sender<()>>>>);

    impl TestTimer {
        fn fire(&self) {
            for send in self.0.lock().drain(..) {
                let _ = send.send(());
            }
        }
    }

    impl Timer for TestTimer {
        fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let (send, recv) = oneshot::channel();
            self.0.lock().push(send);
            Box::pin(async move {
                if recv.await.is_err() {
                    // The timer is gone; never time out.
                    std::future::pending::<()>().await;
                }
            })
        }
    }

    struct TestServer {
        messages: mpsc::UnboundedReceiver<OutgoingMessage>,
        send: mpsc::UnboundedSender<Vec<u8>>,
        synic: Arc<TestSynic>,
        timer: TestTimer,
    }

    impl TestServer {
        async fn next(&mut self) -> OutgoingMessage {
            self.messages.next().await.unwrap()
        }

        fn send<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(&self, msg: &T) {
            self.send.unbounded_send(in_msg(msg)).unwrap();
        }

        fn send_raw(&self, data: Vec<u8>) {
            self.send.unbounded_send(data).unwrap();
        }

        fn assert_idle(&mut self) {
            assert!(self.messages.try_next().is_err(), "unexpected message");
        }

        async fn connect(&mut self, client: &mut VmbusClient, channels: &[u32]) -> ConnectResult {
            let client_connect = client.connect(0, None, VMBUS_TEST_CLIENT_ID);
            let server_connect = async {
                let _ = self.next().await;
                self.send(&version_response(true));
                check_message(self.next().await, protocol::RequestOffers {});
                for &channel_id in channels {
                    self.send(&offer(channel_id));
                }
                self.send(&protocol::AllOffersDelivered {});
            };
            let (result, ()) = (client_connect, server_connect).join().await;
            result.unwrap()
        }

        async fn get_channel(&mut self, client: &mut VmbusClient) -> OfferInfo {
            let mut result = self.connect(client, &[1]).await;
            result.offers.pop().unwrap()
        }

        /// Creates a GPADL on the channel and answers it.
        async fn create_gpadl(&mut self, handle: &ChannelHandle, buffer: GpadlBuffer) -> GpadlId {
            let create = handle.create_gpadl(None, buffer);
            let serve = async {
                let msg = self.next().await;
                let (_, rest) = MessageHeader::read_from_prefix(msg.data()).unwrap();
                let (header, _) = protocol::GpadlHeader::read_from_prefix(rest).unwrap();
                self.send(&protocol::GpadlCreated {
                    channel_id: header.channel_id,
                    gpadl_id: header.gpadl_id,
                    status: protocol::STATUS_SUCCESS,
                });
            };
            let (id, ()) = (create, serve).join().await;
            id.unwrap()
        }

        async fn open(&mut self, handle: &ChannelHandle, request: OpenRequest) -> OpenOutput {
            let open = handle.open(request);
            let serve = async {
                let _ = self.next().await;
                self.send(&open_result(handle.channel_id(), request.open_id, 0));
            };
            let (output, ()) = (open, serve).join().await;
            output.unwrap()
        }
    }

    fn open_result(channel_id: ChannelId, open_id: u32, status: u32) -> protocol::OpenResult {
        protocol::OpenResult {
            channel_id,
            open_id,
            status,
        }
    }

    fn ring_buffer() -> GpadlBuffer {
        gpadl_buffer_from_pages(&[1, 2, 3, 4]).unwrap()
    }

    fn open_request(ring_gpadl_id: GpadlId) -> OpenRequest {
        OpenRequest {
            open_id: 7,
            target_vp: 0,
            ring_gpadl_id,
            ring_buffer_page_offset: 2,
            user_data: UserDefinedData::default(),
        }
    }

    fn run_test<F, Fut>(config: ClientConfig, f: F)
    where
        F: FnOnce(TestServer, VmbusClient) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut pool = LocalPool::new();
        let (msg_send, msg_recv) = mpsc::unbounded();
        let (post_send, post_recv) = mpsc::unbounded();
        let synic = Arc::new(TestSynic::default());
        let timer = TestTimer::default();
        let client = VmbusClientBuilder::new(
            synic.clone(),
            TestMessageSource(msg_recv),
            TestPoster(post_send),
            timer.clone(),
        )
        .with_config(config)
        .build(&pool.spawner())
        .unwrap();
        let server = TestServer {
            messages: post_recv,
            send: msg_send,
            synic,
            timer,
        };
        pool.run_until(f(server, client));
    }

    #[test]
    fn test_initiate_contact() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let connect = client.connect(
                0,
                Some(MonitorPageGpas {
                    parent_to_child: 0x123f000,
                    child_to_parent: 0x321f000,
                }),
                VMBUS_TEST_CLIENT_ID,
            );
            let serve = async {
                check_message(
                    server.next().await,
                    protocol::InitiateContact2 {
                        initiate_contact: protocol::InitiateContact {
                            version_requested: Version::Copper as u32,
                            target_message_vp: 0,
                            interrupt_page_or_target_info: TargetInfo::new()
                                .with_sint(2)
                                .with_vtl(0)
                                .with_feature_flags(SUPPORTED_FEATURE_FLAGS.into())
                                .into(),
                            parent_to_child_monitor_page_gpa: 0x123f000,
                            child_to_parent_monitor_page_gpa: 0x321f000,
                        },
                        client_id: VMBUS_TEST_CLIENT_ID,
                    },
                );
                server.send(&version_response(true));
                check_message(server.next().await, protocol::RequestOffers {});
                server.send(&offer(1));
                server.send(&offer(2));
                server.send(&protocol::AllOffersDelivered {});
            };
            let (result, ()) = (connect, serve).join().await;
            let result = result.unwrap();
            assert_eq!(result.version.version, Version::Copper);
            assert_eq!(result.version.feature_flags, SUPPORTED_FEATURE_FLAGS);
            assert_eq!(result.offers.len(), 2);
            assert_eq!(result.offers[0].offer, offer(1));
            assert_eq!(result.offers[1].handle.channel_id(), ChannelId(2));

            // A second connect is refused.
            assert!(matches!(
                client.connect(0, None, Guid::ZERO).await,
                Err(ConnectError::InvalidState)
            ));
        });
    }

    #[test]
    fn test_version_fallback() {
        let config = ClientConfig {
            supported_versions: vec![Version::Win10, Version::Win10Rs4],
            ..Default::default()
        };
        run_test(config, |mut server, mut client| async move {
            let connect = client.connect(1, None, Guid::ZERO);
            let serve = async {
                let initiate = |version: Version| protocol::InitiateContact {
                    version_requested: version as u32,
                    target_message_vp: 1,
                    interrupt_page_or_target_info: TargetInfo::new()
                        .with_sint(2)
                        .with_vtl(0)
                        .into(),
                    parent_to_child_monitor_page_gpa: 0,
                    child_to_parent_monitor_page_gpa: 0,
                };
                let rejected = server.next().await;
                check_message(rejected.clone(), initiate(Version::Win10Rs4));
                assert_eq!(requested_version(&rejected), make_version(5, 1));
                server.send(&version_response(false).version_response);
                let accepted = server.next().await;
                check_message(accepted.clone(), initiate(Version::Win10));
                assert_eq!(requested_version(&accepted), make_version(4, 0));
                server.send(&version_response(true).version_response);
                check_message(server.next().await, protocol::RequestOffers {});
                server.send(&protocol::AllOffersDelivered {});
            };
            let (result, ()) = (connect, serve).join().await;
            let result = result.unwrap();
            assert_eq!(result.version.version as u32, make_version(4, 0));
            assert_eq!(result.version.feature_flags, FeatureFlags::new());
        });
    }

    #[test]
    fn test_no_supported_versions() {
        let config = ClientConfig {
            supported_versions: vec![Version::Win10Rs5, Version::Win10],
            ..Default::default()
        };
        run_test(config, |mut server, mut client| async move {
            let connect = client.connect(0, None, Guid::ZERO);
            let serve = async {
                for _ in 0..2 {
                    let _ = server.next().await;
                    server.send(&version_response(false).version_response);
                }
            };
            let (result, ()) = (connect, serve).join().await;
            assert!(matches!(result, Err(ConnectError::NoSupportedVersions)));
            server.assert_idle();
        });
    }

    #[test]
    fn test_connection_refused() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let connect = client.connect(0, None, Guid::ZERO);
            let serve = async {
                let _ = server.next().await;
                let mut response = version_response(true);
                response.version_response.connection_state = ConnectionState::FAILED_LOW_RESOURCES;
                server.send(&response);
            };
            let (result, ()) = (connect, serve).join().await;
            assert!(matches!(
                result,
                Err(ConnectError::FailedToConnect(ConnectionState::FAILED_LOW_RESOURCES))
            ));
        });
    }

    #[test]
    fn test_passive_connect() {
        let config = ClientConfig {
            request_offers: false,
            ..Default::default()
        };
        run_test(config, |mut server, mut client| async move {
            let connect = client.connect(0, None, Guid::ZERO);
            let serve = async {
                let _ = server.next().await;
                server.send(&version_response(true));
            };
            let (result, ()) = (connect, serve).join().await;
            let mut result = result.unwrap();
            assert!(result.offers.is_empty());
            server.assert_idle();

            server.send(&offer(3));
            let info = result.offer_recv.next().await.unwrap();
            assert_eq!(info.offer.channel_id, ChannelId(3));
        });
    }

    #[test]
    fn test_connect_timeout() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let connect = client.connect(0, None, Guid::ZERO);
            let serve = async {
                let _ = server.next().await;
                server.timer.fire();
            };
            let (result, ()) = (connect, serve).join().await;
            assert!(matches!(result, Err(ConnectError::Timeout)));
        });
    }

    #[test]
    fn test_open_channel() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            let open = handle.open(open_request(gpadl_id));
            let serve = async {
                check_message(
                    server.next().await,
                    protocol::OpenChannel2 {
                        open_channel: protocol::OpenChannel {
                            channel_id: ChannelId(1),
                            open_id: 7,
                            ring_buffer_gpadl_id: gpadl_id,
                            target_vp: 0,
                            downstream_ring_buffer_page_offset: 2,
                            user_data: UserDefinedData::default(),
                        },
                        connection_id: 0x1001,
                        event_flag: 1,
                        flags: OpenChannelFlags::new(),
                    },
                );
                // A mismatched open ID is ignored.
                server.send(&open_result(ChannelId(1), 8, 0));
                server.send(&open_result(ChannelId(1), 7, 0));
            };
            let (output, ()) = (open, serve).join().await;
            let output = output.unwrap();
            assert_eq!(output.connection_id, 0x1001);
            assert_eq!(output.event_flag, 1);
            assert!(server.synic.mapped.lock().contains_key(&1));

            assert!(matches!(
                handle.open(open_request(gpadl_id)).await,
                Err(ChannelError::AlreadyOpen)
            ));
            server.assert_idle();
        });
    }

    #[test]
    fn test_open_failure_and_reopen() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            let open = handle.open(open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.send(&open_result(ChannelId(1), 7, 0xc000_0001));
            };
            let (result, ()) = (open, serve).join().await;
            assert!(matches!(result, Err(ChannelError::OpenFailed(0xc000_0001))));
            assert!(server.synic.mapped.lock().is_empty());

            server.open(&handle, open_request(gpadl_id)).await;
        });
    }

    #[test]
    fn test_open_queue_closes_on_ring_failure() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let pool = PagePool::new(0x100, 4);
            let ring_gpadl = gpadl_buffer_from_pages(&pool.gpns()).unwrap();
            let gpadl_id = server.create_gpadl(&handle, ring_gpadl).await;

            // Offset 3 leaves the receive ring without a data page.
            let request = OpenRequest {
                ring_buffer_page_offset: 3,
                ..open_request(gpadl_id)
            };
            let open = handle.open_queue(&pool, request);
            let serve = async {
                let _ = server.next().await;
                server.send(&open_result(ChannelId(1), 7, 0));
                check_message(
                    server.next().await,
                    protocol::CloseChannel {
                        channel_id: ChannelId(1),
                    },
                );
                server.send(&protocol::RelIdReleased {
                    channel_id: ChannelId(1),
                });
            };
            let (result, ()) = (open, serve).join().await;
            assert!(matches!(
                result,
                Err(ChannelError::Ring(GpadlRingError::InvalidPageOffset {
                    offset: 3,
                    page_count: 4
                }))
            ));
            assert!(server.synic.mapped.lock().is_empty());

            let open = handle.open_queue(&pool, open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.send(&open_result(ChannelId(1), 7, 0));
            };
            let (opened, ()) = (open, serve).join().await;
            assert_eq!(opened.unwrap().channel_id(), ChannelId(1));
        });
    }

    #[test]
    fn test_open_without_event_flag() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let mut connection = server.connect(&mut client, &[0x10000]).await;
            let handle = connection.offers.pop().unwrap().handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            assert!(matches!(
                handle.open(open_request(gpadl_id)).await,
                Err(ChannelError::NoEventFlag(ChannelId(0x10000)))
            ));
            assert!(server.synic.mapped.lock().is_empty());
            server.assert_idle();
        });
    }

    #[test]
    fn test_handles_dropped_while_open() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;
            let output = server.open(&handle, open_request(gpadl_id)).await;

            drop(handle);
            check_message(
                server.next().await,
                protocol::CloseChannel {
                    channel_id: ChannelId(1),
                },
            );
            assert!(output.incoming_signal.is_closed());
        });
    }

    #[test]
    fn test_handles_dropped_while_opening() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            // The caller gives up on the open, leaving the channel opening.
            let open = handle.open(open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.timer.fire();
            };
            let (result, ()) = (open, serve).join().await;
            assert!(matches!(result, Err(ChannelError::Timeout)));
            drop(handle);
            yield_to_client().await;
            server.assert_idle();

            // Nobody is left to close the channel once it opens.
            server.send(&open_result(ChannelId(1), 7, 0));
            check_message(
                server.next().await,
                protocol::CloseChannel {
                    channel_id: ChannelId(1),
                },
            );
            assert!(server.synic.mapped.lock().is_empty());
        });
    }

    #[test]
    fn test_open_requires_created_gpadl() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let result = server.connect(&mut client, &[1, 2]).await;
            let [first, second] = <[OfferInfo; 2]>::try_from(result.offers).unwrap();

            assert!(matches!(
                first.handle.open(open_request(GpadlId(5))).await,
                Err(ChannelError::UnknownGpadl(GpadlId(5)))
            ));

            // A GPADL created on another channel cannot back the rings.
            let gpadl_id = server.create_gpadl(&second.handle, ring_buffer()).await;
            assert!(matches!(
                first.handle.open(open_request(gpadl_id)).await,
                Err(ChannelError::GpadlNotReady(_))
            ));

            // Nor can one still being created.
            let create = first.handle.create_gpadl(Some(GpadlId(9)), ring_buffer());
            let open = async {
                let _ = server.next().await;
                let result = first.handle.open(open_request(GpadlId(9))).await;
                server.send(&protocol::GpadlCreated {
                    channel_id: ChannelId(1),
                    gpadl_id: GpadlId(9),
                    status: protocol::STATUS_SUCCESS,
                });
                result
            };
            let (created, result) = (create, open).join().await;
            assert_eq!(created.unwrap(), GpadlId(9));
            assert!(matches!(result, Err(ChannelError::GpadlNotReady(GpadlId(9)))));
        });
    }

    #[test]
    fn test_gpadl_lifecycle() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;

            let create = handle.create_gpadl(Some(GpadlId(3)), ring_buffer());
            let serve = async {
                let msg = server.next().await;
                let expected = GpadlMessageBuilder::new(protocol::MAX_MESSAGE_SIZE)
                    .unwrap()
                    .build(ChannelId(1), GpadlId(3), &ring_buffer())
                    .unwrap();
                assert_eq!(expected.len(), 1);
                assert_eq!(msg, expected[0]);
                server.send(&protocol::GpadlCreated {
                    channel_id: ChannelId(1),
                    gpadl_id: GpadlId(3),
                    status: protocol::STATUS_SUCCESS,
                });
            };
            let (id, ()) = (create, serve).join().await;
            assert_eq!(id.unwrap(), GpadlId(3));

            assert!(matches!(
                handle.create_gpadl(Some(GpadlId(3)), ring_buffer()).await,
                Err(ChannelError::HandleInUse(GpadlId(3)))
            ));

            let teardown = handle.teardown_gpadl(GpadlId(3));
            let serve = async {
                check_message(
                    server.next().await,
                    protocol::GpadlTeardown {
                        channel_id: ChannelId(1),
                        gpadl_id: GpadlId(3),
                    },
                );
                // The handle cannot be reused before or after the remote
                // confirms the teardown.
                assert!(matches!(
                    handle.create_gpadl(Some(GpadlId(3)), ring_buffer()).await,
                    Err(ChannelError::HandleTornDown(GpadlId(3)))
                ));
                server.send(&protocol::GpadlTorndown {
                    gpadl_id: GpadlId(3),
                });
            };
            let (result, ()) = (teardown, serve).join().await;
            result.unwrap();

            assert!(matches!(
                handle.create_gpadl(Some(GpadlId(3)), ring_buffer()).await,
                Err(ChannelError::HandleTornDown(GpadlId(3)))
            ));
            assert!(matches!(
                handle.teardown_gpadl(GpadlId(3)).await,
                Err(ChannelError::HandleTornDown(GpadlId(3)))
            ));
            assert!(matches!(
                handle.open(open_request(GpadlId(3))).await,
                Err(ChannelError::HandleTornDown(GpadlId(3)))
            ));
            server.assert_idle();
        });
    }

    #[test]
    fn test_gpadl_creation_failed() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;

            let create = handle.create_gpadl(Some(GpadlId(4)), ring_buffer());
            let serve = async {
                let _ = server.next().await;
                server.send(&protocol::GpadlCreated {
                    channel_id: ChannelId(1),
                    gpadl_id: GpadlId(4),
                    status: -1,
                });
            };
            let (result, ()) = (create, serve).join().await;
            assert!(matches!(result, Err(ChannelError::GpadlCreationFailed(-1))));

            // The handle was released.
            assert!(matches!(
                handle.teardown_gpadl(GpadlId(4)).await,
                Err(ChannelError::UnknownGpadl(GpadlId(4)))
            ));
        });
    }

    #[test]
    fn test_close() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;
            let output = server.open(&handle, open_request(gpadl_id)).await;

            let close = handle.close();
            let serve = async {
                check_message(
                    server.next().await,
                    protocol::CloseChannel {
                        channel_id: ChannelId(1),
                    },
                );
                server.send(&protocol::RelIdReleased {
                    channel_id: ChannelId(1),
                });
            };
            let (result, ()) = (close, serve).join().await;
            result.unwrap();
            assert!(output.incoming_signal.is_closed());
            assert!(server.synic.mapped.lock().is_empty());

            // Closing a closed channel is refused, reopening is not.
            assert!(matches!(
                handle.close().await,
                Err(ChannelError::InvalidState("Closed"))
            ));
            server.open(&handle, open_request(gpadl_id)).await;

            // The remote never releases the channel this time.
            let close = handle.close();
            let serve = async {
                let _ = server.next().await;
                server.timer.fire();
            };
            let (result, ()) = (close, serve).join().await;
            result.unwrap();
        });
    }

    #[test]
    fn test_open_timeout() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            let open = handle.open(open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.timer.fire();
            };
            let (result, ()) = (open, serve).join().await;
            assert!(matches!(result, Err(ChannelError::Timeout)));

            // The channel is still opening.
            assert!(matches!(
                handle.open(open_request(gpadl_id)).await,
                Err(ChannelError::AlreadyOpen)
            ));
        });
    }

    #[test]
    fn test_rescind() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let mut connection = server.connect(&mut client, &[1]).await;
            let channel = connection.offers.pop().unwrap();
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            let open = handle.open(open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.send(&protocol::RescindChannelOffer {
                    channel_id: ChannelId(1),
                });
            };
            let (result, ()) = (open, serve).join().await;
            assert!(matches!(result, Err(ChannelError::ChannelRescinded)));
            channel.revoke_recv.await.unwrap();
            assert!(channel.rescinded.is_set());
            assert!(server.synic.mapped.lock().is_empty());

            assert!(matches!(
                handle.open(open_request(gpadl_id)).await,
                Err(ChannelError::ChannelRescinded)
            ));

            // The channel is released once its last GPADL is gone.
            let teardown = handle.teardown_gpadl(gpadl_id);
            let serve = async {
                let _ = server.next().await;
                server.assert_idle();
                server.send(&protocol::GpadlTorndown { gpadl_id });
            };
            let (result, ()) = (teardown, serve).join().await;
            result.unwrap();
            check_message(
                server.next().await,
                protocol::RelIdReleased {
                    channel_id: ChannelId(1),
                },
            );

            // The channel ID can be offered again, with a new handle.
            server.send(&offer(1));
            let reoffered = connection.offer_recv.next().await.unwrap();
            assert!(!reoffered.rescinded.is_set());
            assert!(matches!(
                handle.create_gpadl(None, ring_buffer()).await,
                Err(ChannelError::ChannelRescinded)
            ));
        });
    }

    #[test]
    fn test_duplicate_offer() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let mut result = server.connect(&mut client, &[1]).await;
            let channel = result.offers.pop().unwrap();

            server.send(&offer(1));
            channel.revoke_recv.await.unwrap();
            check_message(
                server.next().await,
                protocol::RelIdReleased {
                    channel_id: ChannelId(1),
                },
            );
            assert!(result.offer_recv.try_next().is_err());
        });
    }

    #[test]
    fn test_disconnect() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;
            let output = server.open(&handle, open_request(gpadl_id)).await;

            let disconnect = client.disconnect();
            let serve = async {
                check_message(server.next().await, protocol::Unload {});
                server.send(&protocol::UnloadComplete {});
            };
            let (result, ()) = (disconnect, serve).join().await;
            result.unwrap();
            channel.revoke_recv.await.unwrap();
            assert!(output.incoming_signal.is_closed());

            assert!(matches!(
                handle.open(open_request(gpadl_id)).await,
                Err(ChannelError::Disconnected)
            ));
            assert!(matches!(
                client.disconnect().await,
                Err(ConnectError::InvalidState)
            ));

            // The client can connect again.
            server.connect(&mut client, &[1]).await;
        });
    }

    #[test]
    fn test_malformed_message_faults_connection() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let gpadl_id = server.create_gpadl(&handle, ring_buffer()).await;

            let open = handle.open(open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.send_raw(vec![0xff, 0, 0, 0, 0, 0, 0, 0]);
            };
            let (result, ()) = (open, serve).join().await;
            assert!(matches!(result, Err(ChannelError::ConnectionFault)));
            channel.revoke_recv.await.unwrap();
            assert!(server.synic.mapped.lock().is_empty());

            server.connect(&mut client, &[]).await;
        });
    }

    #[test]
    fn test_malformed_message_fails_connect() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let connect = client.connect(0, None, Guid::ZERO);
            let serve = async {
                let _ = server.next().await;
                // Too short for a version response.
                server.send_raw(in_msg(&version_response(true))[..10].to_vec());
            };
            let (result, ()) = (connect, serve).join().await;
            assert!(matches!(
                result,
                Err(ConnectError::MalformedMessage(ParseError::MessageTooSmall(_)))
            ));
        });
    }

    #[test]
    fn test_hvsock() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let mut result = server.connect(&mut client, &[]).await;
            let request = HvsockConnectRequest {
                service_id: guid(1),
                endpoint_id: guid(2),
                silo_id: guid(3),
            };

            let connect = client.connect_hvsock(request);
            let serve = async {
                check_message(server.next().await, protocol::TlConnectRequest2::from(request));
                let mut offer = offer(5);
                offer.interface_id = request.service_id;
                offer.instance_id = request.endpoint_id;
                offer.flags = offer.flags.with_tlnpi_provider(true);
                server.send(&offer);
            };
            let (info, ()) = (connect, serve).join().await;
            assert_eq!(info.unwrap().offer.channel_id, ChannelId(5));
            // The offer answered the request and was not reported separately.
            assert!(result.offer_recv.try_next().is_err());

            let connect = client.connect_hvsock(request);
            let serve = async {
                let _ = server.next().await;
                server.send(&protocol::TlConnectResult {
                    service_id: request.service_id,
                    endpoint_id: request.endpoint_id,
                    status: -1,
                });
            };
            let (info, ()) = (connect, serve).join().await;
            assert!(info.is_none());
        });
    }

    #[test]
    fn test_data_plane() {
        run_test(ClientConfig::default(), |mut server, mut client| async move {
            let channel = server.get_channel(&mut client).await;
            let handle = channel.handle;
            let pool = PagePool::new(0x100, 4);
            let ring_gpadl = gpadl_buffer_from_pages(&pool.gpns()).unwrap();
            let gpadl_id = server.create_gpadl(&handle, ring_gpadl.clone()).await;

            let open = handle.open_queue(&pool, open_request(gpadl_id));
            let serve = async {
                let _ = server.next().await;
                server.send(&open_result(ChannelId(1), 7, 0));
            };
            let (opened, ()) = (open, serve).join().await;
            let mut opened = opened.unwrap();
            assert_eq!(opened.channel_id(), ChannelId(1));

            let (in_ring, out_ring) =
                make_rings(&pool, &ring_gpadl, 2, RingRole::Offerer).unwrap();
            let mut host = Queue::new(RawAsyncChannel {
                in_ring,
                out_ring,
                signal: Box::new(HostSignal {
                    synic: server.synic.clone(),
                    event_flag: 1,
                }),
            })
            .unwrap();

            opened
                .write(OutgoingPacket {
                    transaction_id: 0,
                    packet_type: OutgoingPacketType::InBandNoCompletion,
                    payload: &[b"ping"],
                })
                .await
                .unwrap();
            {
                let (mut reader, _) = host.split();
                let packet = reader.read().await.unwrap();
                let IncomingPacket::Data(data) = &*packet else {
                    panic!("expected data");
                };
                assert_eq!(data.reader().read_all().unwrap(), b"ping");
            }

            host.try_write(&OutgoingPacket {
                transaction_id: 0,
                packet_type: OutgoingPacketType::InBandNoCompletion,
                payload: &[b"pong"],
            })
            .unwrap();
            {
                let mut reader = opened.reader();
                let packet = reader.read().await.unwrap();
                let IncomingPacket::Data(data) = &*packet else {
                    panic!("expected data");
                };
                assert_eq!(data.reader().read_all().unwrap(), b"pong");
            }

            server.send(&protocol::RescindChannelOffer {
                channel_id: ChannelId(1),
            });
            channel.revoke_recv.await.unwrap();
            assert!(opened.is_rescinded());
            assert!(matches!(
                opened.try_write(&OutgoingPacket {
                    transaction_id: 0,
                    packet_type: OutgoingPacketType::InBandNoCompletion,
                    payload: &[b"late"],
                }),
                Err(SendError::ChannelRescinded)
            ));
        });
    }
}
