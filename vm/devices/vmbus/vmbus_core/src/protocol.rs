// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions of the vmbus control protocol.

use crate::VersionInfo;
use bitfield_struct::bitfield;
use open_enum::open_enum;
use std::fmt;
use std::mem::size_of;
use std::ops::BitAnd;
use std::ops::BitOr;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

type Guid = guid::Guid;

pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_UNSUCCESSFUL: i32 = 0x8000ffff_u32 as i32;
pub const STATUS_CONNECTION_REFUSED: i32 = 0xc0000236_u32 as i32;

/// The connection ID that control messages from the client are posted to.
pub const VMBUS_MESSAGE_REDIRECT_CONNECTION_ID: u32 = 0x800074;
/// The hypervisor message type of every vmbus control message.
pub const VMBUS_MESSAGE_TYPE: u32 = 1;

pub const HEADER_SIZE: usize = size_of::<MessageHeader>();

/// The payload size of a hypervisor message, which bounds every control
/// message.
pub const MAX_MESSAGE_SIZE: usize = 240;

// Version gates reject messages that the negotiated protocol does not define.
// Messages exchanged before a version is agreed carry no version gate.
vmbus_messages! {
    pub enum Message, MessageType |cx| {
        1 OFFER_CHANNEL => OfferChannel if cx.since(Version::V1);
        2 RESCIND_CHANNEL_OFFER => RescindChannelOffer if cx.since(Version::V1);
        3 REQUEST_OFFERS => RequestOffers if cx.since(Version::V1);
        4 ALL_OFFERS_DELIVERED => AllOffersDelivered if cx.since(Version::V1);
        5 OPEN_CHANNEL =>
            OpenChannel2 if cx.since(Version::Copper)
                && (cx.features.guest_specified_signal_parameters()
                    || cx.features.channel_interrupt_redirection()),
            OpenChannel if cx.since(Version::V1);
        6 OPEN_CHANNEL_RESULT => OpenResult if cx.since(Version::V1);
        7 CLOSE_CHANNEL => CloseChannel if cx.since(Version::V1);
        8 GPADL_HEADER => GpadlHeader if cx.since(Version::V1);
        9 GPADL_BODY => GpadlBody if cx.since(Version::V1);
        10 GPADL_CREATED => GpadlCreated if cx.since(Version::V1);
        11 GPADL_TEARDOWN => GpadlTeardown if cx.since(Version::V1);
        12 GPADL_TORNDOWN => GpadlTorndown if cx.since(Version::V1);
        13 REL_ID_RELEASED => RelIdReleased if cx.since(Version::V1);
        // Only the size tells the extended forms apart, since no version has
        // been agreed yet.
        14 INITIATE_CONTACT =>
            InitiateContact2 if cx.fits::<InitiateContact2>(),
            InitiateContact;
        15 VERSION_RESPONSE =>
            VersionResponse2 if cx.fits::<VersionResponse2>(),
            VersionResponse;
        16 UNLOAD => Unload if cx.since(Version::V1);
        17 UNLOAD_COMPLETE => UnloadComplete if cx.since(Version::Win7);
        18 OPEN_RESERVED_CHANNEL => OpenReservedChannel if cx.since(Version::Win10);
        19 CLOSE_RESERVED_CHANNEL => CloseReservedChannel;
        20 CLOSE_RESERVED_RESPONSE => CloseReservedChannelResponse if cx.since(Version::Win10);
        // Some senders keep using the short request on newer protocols.
        21 TL_CONNECT_REQUEST =>
            TlConnectRequest2 if cx.since(Version::Win10Rs5) && cx.fits::<TlConnectRequest2>(),
            TlConnectRequest if cx.since(Version::Win10);
        23 TL_CONNECT_REQUEST_RESULT => TlConnectResult if cx.since(Version::Win10Rs3_0);
    }
}

/// The state a message is parsed against.
struct ParseContext<'a> {
    /// `None` while disconnected.
    version: Option<Version>,
    features: FeatureFlags,
    body: &'a [u8],
}

impl<'a> ParseContext<'a> {
    fn new(version: Option<VersionInfo>, body: &'a [u8]) -> Self {
        Self {
            version: version.map(|v| v.version),
            features: version.map_or_else(FeatureFlags::new, |v| v.feature_flags),
            body,
        }
    }

    /// Whether the connection negotiated `version` or later.
    fn since(&self, version: Version) -> bool {
        self.version >= Some(version)
    }

    /// Whether the body is large enough to hold a `T`.
    fn fits<T>(&self) -> bool {
        self.body.len() >= size_of::<T>()
    }
}

fn decode_body<T: FromBytes>(typ: MessageType, body: &[u8]) -> Result<(T, &[u8]), ParseError> {
    T::read_from_prefix(body).map_err(|_| ParseError::MessageTooSmall(Some(typ)))
}

impl<'a> Message<'a> {
    /// Parses a vmbus control message, accepting only messages that are valid
    /// at the specified protocol version.
    ///
    /// Use `None` for the version to only parse messages that are accepted
    /// while disconnected.
    pub fn parse(data: &'a [u8], version: Option<VersionInfo>) -> Result<Self, ParseError> {
        let message = Self::parse_unchecked(data, version)?;
        message.validate()?;
        Ok(message)
    }

    /// Checks the variable-length data that trails the fixed-size struct.
    fn validate(&self) -> Result<(), ParseError> {
        match self {
            Message::GpadlHeader(header, data) => header.validate(data),
            Message::GpadlBody(_, data) => {
                if data.len() < size_of::<u64>() {
                    return Err(ParseError::InvalidGpadlBody);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// An error that occurred while parsing a vmbus protocol message.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The message was smaller than required for the message type.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The message type is not a valid vmbus protocol message, or a message that is not supported
    /// with the current protocol version.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
    #[error("gpadl header range length or count is inconsistent")]
    InvalidGpadlHeader,
    #[error("gpadl body carries no page numbers")]
    InvalidGpadlBody,
}

/// Implemented by every message struct in the catalog above.
pub trait VmbusMessage: Sized {
    /// The corresponding message type for the struct.
    const MESSAGE_TYPE: MessageType;

    /// The size of the message, including the vmbus message header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header of a vmbus message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// Creates a new `MessageHeader` for the specified message type.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct FeatureFlags {
    /// The opener may choose the event flag and connection ID used to signal
    /// the channel.
    pub guest_specified_signal_parameters: bool,

    /// The `redirect_interrupt` open flag is supported.
    pub channel_interrupt_redirection: bool,

    /// The connection's monitor pages may be changed after connecting.
    pub modify_connection: bool,

    /// The client identifies itself with a GUID when initiating contact.
    pub client_id: bool,

    /// The confidential offer flags are supported.
    pub confidential_channels: bool,

    #[bits(27)]
    _reserved: u32,
}

impl FeatureFlags {
    pub const fn all() -> Self {
        Self::new()
            .with_guest_specified_signal_parameters(true)
            .with_channel_interrupt_redirection(true)
            .with_modify_connection(true)
            .with_client_id(true)
            .with_confidential_channels(true)
    }

    pub fn contains_unsupported_bits(&self) -> bool {
        u32::from(*self) & !u32::from(Self::all()) != 0
    }
}

impl BitAnd for FeatureFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        (self.into_bits() & rhs.into_bits()).into()
    }
}

impl BitOr for FeatureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        (self.into_bits() | rhs.into_bits()).into()
    }
}

/// A GPADL handle, chosen by the endpoint that registers the memory.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

/// The relative identifier of a channel, assigned by the offering endpoint.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    pub interrupt_page_or_target_info: u64, // sint, vtl, feature flags
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

/// Initiate contact message sent when the client ID feature is requested
/// (Copper and above).
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InitiateContact2 {
    pub initiate_contact: InitiateContact,
    pub client_id: Guid,
}

impl From<InitiateContact> for InitiateContact2 {
    fn from(value: InitiateContact) -> Self {
        Self {
            initiate_contact: value,
            ..FromZeros::new_zeroed()
        }
    }
}

/// Helper struct to interpret the `InitiateContact::interrupt_page_or_target_info` field.
#[bitfield(u64)]
pub struct TargetInfo {
    pub sint: u8,
    pub vtl: u8,
    pub _padding: u16,
    pub feature_flags: u32,
}

pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V1 = make_version(0, 13),
    Win7 = make_version(1, 1),
    Win8 = make_version(2, 4),
    Win8_1 = make_version(3, 0),
    Win10 = make_version(4, 0),
    Win10Rs3_0 = make_version(4, 1),
    Win10Rs3_1 = make_version(5, 0),
    Win10Rs4 = make_version(5, 1),
    Win10Rs5 = make_version(5, 2),
    Iron = make_version(5, 3),
    Copper = make_version(6, 0),
}

impl Version {
    /// Every known version, oldest first.
    pub const ALL: [Version; 11] = [
        Version::V1,
        Version::Win7,
        Version::Win8,
        Version::Win8_1,
        Version::Win10,
        Version::Win10Rs3_0,
        Version::Win10Rs3_1,
        Version::Win10Rs4,
        Version::Win10Rs5,
        Version::Iron,
        Version::Copper,
    ];

    pub const fn major(self) -> u16 {
        ((self as u32) >> 16) as u16
    }

    pub const fn minor(self) -> u16 {
        self as u32 as u16
    }
}

impl TryFrom<u32> for Version {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|v| *v as u32 == value)
            .ok_or(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

open_enum! {
    /// Possible values for the `VersionResponse::connection_state` field.
    #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
    pub enum ConnectionState: u8 {
        SUCCESSFUL = 0,
        FAILED_LOW_RESOURCES = 1,
        FAILED_UNKNOWN_FAILURE = 2,
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: ConnectionState,
    pub padding: u16,
    pub selected_version_or_connection_id: u32,
}

/// Version response message used by `Version::Copper` and above.
///
/// Only sent when the requested version is Copper or later and is supported;
/// rejections always use the original `VersionResponse`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VersionResponse2 {
    pub version_response: VersionResponse,
    pub supported_features: u32,
}

impl From<VersionResponse> for VersionResponse2 {
    fn from(value: VersionResponse) -> Self {
        Self {
            version_response: value,
            ..FromZeros::new_zeroed()
        }
    }
}

/// Device-specific data carried in an offer or an open request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C, align(4))]
pub struct UserDefinedData([u8; 120]);

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<[u8; 120]> for UserDefinedData {
    fn from(value: [u8; 120]) -> Self {
        Self(value)
    }
}

impl From<UserDefinedData> for [u8; 120] {
    fn from(value: UserDefinedData) -> Self {
        value.0
    }
}

impl UserDefinedData {
    /// Hvsocket offers carry a 32-bit pipe type followed by this flag byte.
    const HVSOCK_GUEST_ACCEPT_OFFSET: usize = 4;

    /// For an hvsocket offer, whether the offer is for a connection initiated
    /// by the remote side rather than in answer to a connect request.
    pub fn hvsock_is_for_guest_accept(&self) -> bool {
        self.0[Self::HVSOCK_GUEST_ACCEPT_OFFSET] != 0
    }

    pub fn set_hvsock_is_for_guest_accept(&mut self, value: bool) {
        self.0[Self::HVSOCK_GUEST_ACCEPT_OFFSET] = value.into();
    }
}

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    pub connection_id: u32,
}

impl OfferChannel {
    /// The monitor ID assigned to the channel, if any.
    pub fn monitor_id(&self) -> Option<u8> {
        (self.monitor_allocated != 0).then_some(self.monitor_id)
    }
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    pub enumerate_device_interface: bool, // 0x1
    /// The channel must use an encrypted ring buffer on an isolated VM.
    pub confidential_ring_buffer: bool, // 0x2
    /// The channel must use encrypted additional GPADLs and GPA direct ranges
    /// on an isolated VM.
    pub confidential_external_memory: bool, // 0x4
    #[bits(1)]
    _reserved1: u16,
    pub named_pipe_mode: bool, // 0x10
    #[bits(8)]
    _reserved2: u16,
    pub tlnpi_provider: bool, // 0x2000
    #[bits(2)]
    _reserved3: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

/// The first message of a GPADL registration. The range buffer that follows
/// is `len` bytes long in total and describes `count` ranges; whatever does
/// not fit in this message is carried by [`GpadlBody`] messages.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub len: u16,
    pub count: u16,
}

impl GpadlHeader {
    /// The maximum number of 64 bit values that fit after the message data.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();

    /// The number of `u64` entries in the complete range buffer.
    pub fn entry_count(&self) -> usize {
        self.len as usize / size_of::<u64>()
    }

    fn validate(&self, data: &[u8]) -> Result<(), ParseError> {
        let len = self.len as usize;
        // Each range needs at least a header word and one page number.
        if len == 0
            || len % size_of::<u64>() != 0
            || self.count == 0
            || len < self.count as usize * 2 * size_of::<u64>()
            || data.len() < size_of::<u64>()
        {
            return Err(ParseError::InvalidGpadlHeader);
        }
        Ok(())
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlBody {
    /// The sequence number of this body message within the registration,
    /// starting at zero.
    pub msg_number: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// The maximum number of 64 bit values that fit after the message data.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

/// Target VP index value that indicates that interrupts should be disabled for the channel.
pub const VP_INDEX_DISABLE_INTERRUPT: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    /// The page within the ring GPADL where the opener's receive ring starts.
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OpenChannelFlags {
    /// Deliver the channel's interrupts to the redirected VTL and SINT.
    pub redirect_interrupt: bool,

    #[bits(15)]
    pub unused: u16,
}

/// Open channel message used if `guest_specified_signal_parameters` or
/// `channel_interrupt_redirection` was negotiated.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenChannel2 {
    pub open_channel: OpenChannel,

    // Only valid with guest_specified_signal_parameters.
    pub connection_id: u32,
    pub event_flag: u16,

    // Only valid with channel_interrupt_redirection.
    pub flags: OpenChannelFlags,
}

impl From<OpenChannel> for OpenChannel2 {
    fn from(value: OpenChannel) -> Self {
        Self {
            open_channel: value,
            ..FromZeros::new_zeroed()
        }
    }
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct OpenReservedChannel {
    pub channel_id: ChannelId,
    pub target_vp: u32,
    pub target_sint: u32,
    pub ring_buffer_gpadl: GpadlId,
    pub downstream_page_offset: u32,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseReservedChannel {
    pub channel_id: ChannelId,
    pub target_vp: u32,
    pub target_sint: u32,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CloseReservedChannelResponse {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TlConnectRequest {
    pub endpoint_id: Guid,
    pub service_id: Guid,
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TlConnectRequest2 {
    pub base: TlConnectRequest,
    pub silo_id: Guid,
}

impl From<TlConnectRequest> for TlConnectRequest2 {
    fn from(value: TlConnectRequest) -> Self {
        Self {
            base: value,
            ..FromZeros::new_zeroed()
        }
    }
}

#[repr(C)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TlConnectResult {
    pub endpoint_id: Guid,
    pub service_id: Guid,
    pub status: i32,
}

// The remaining structs are for empty messages, provided to simplify the vmbus_messages! macro and
// to allow for consistent use of the VmbusMessage trait for all messages.

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RequestOffers {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Unload {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UnloadComplete {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct AllOffersDelivered {}
