// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The vmbus control protocol: message definitions and encoding, version
//! negotiation, and GPADL message splitting and reassembly.

#![forbid(unsafe_code)]

pub mod gpadl;
pub mod protocol;

use guid::Guid;
use protocol::FeatureFlags;
use protocol::HEADER_SIZE;
use protocol::MAX_MESSAGE_SIZE;
use protocol::MessageHeader;
use protocol::MessageType;
use protocol::Version;
use protocol::VmbusMessage;
use std::fmt::Debug;
use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The version and features a connection settled on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Version,
    pub feature_flags: FeatureFlags,
}

impl VersionInfo {
    /// The result of the server accepting `version`. Features only exist from
    /// Copper on, and are limited to those both sides support.
    pub fn accepted(version: Version, requested: FeatureFlags, supported_features: u32) -> Self {
        let feature_flags = if version >= Version::Copper {
            FeatureFlags::from(supported_features) & requested
        } else {
            FeatureFlags::new()
        };
        Self {
            version,
            feature_flags,
        }
    }
}

/// The version to offer after the server rejected `rejected`: the next older
/// entry of `supported`, which is sorted oldest first.
pub fn fallback_version(supported: &[Version], rejected: Version) -> Option<Version> {
    let index = supported.iter().position(|&v| v == rejected)?;
    supported[..index].last().copied()
}

/// Parses "major.minor" (e.g. "5.3") into a version number. The result need
/// not be a known [`Version`].
pub fn parse_vmbus_version(value: &str) -> Result<u32, String> {
    value
        .split_once('.')
        .and_then(|(major, minor)| {
            Some(protocol::make_version(
                u16::from_str(major).ok()?,
                u16::from_str(minor).ok()?,
            ))
        })
        .ok_or_else(|| format!("invalid vmbus version '{value}'"))
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("a {0} byte message does not fit in a control message")]
pub struct MessageTooLarge(pub usize);

/// An encoded control message, header included, ready to post.
#[derive(Clone)]
pub struct OutgoingMessage {
    buf: [u8; MAX_MESSAGE_SIZE],
    len: usize,
}

impl OutgoingMessage {
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        // Every message struct fits; the catalog asserts it at compile time.
        let mut buf = [0; MAX_MESSAGE_SIZE];
        buf[..HEADER_SIZE].copy_from_slice(MessageHeader::new(T::MESSAGE_TYPE).as_bytes());
        buf[HEADER_SIZE..T::MESSAGE_SIZE].copy_from_slice(message.as_bytes());
        Self {
            buf,
            len: T::MESSAGE_SIZE,
        }
    }

    /// Encodes `message` followed by `data`, such as the page numbers of a
    /// GPADL header.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Result<Self, MessageTooLarge> {
        let mut out = Self::new(message);
        let len = out.len + data.len();
        out.buf
            .get_mut(out.len..len)
            .ok_or(MessageTooLarge(len))?
            .copy_from_slice(data);
        out.len = len;
        Ok(out)
    }

    /// Copies a message that is already encoded.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageTooLarge> {
        let mut buf = [0; MAX_MESSAGE_SIZE];
        buf.get_mut(..data.len())
            .ok_or(MessageTooLarge(data.len()))?
            .copy_from_slice(data);
        Ok(Self {
            buf,
            len: data.len(),
        })
    }

    /// The type tag, or `None` for a message too short to have one.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageHeader::read_from_prefix(self.data())
            .ok()
            .map(|(header, _)| header.message_type())
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("message_type", &self.message_type())
            .field("len", &self.len)
            .finish()
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl Eq for OutgoingMessage {}

/// The guest physical addresses of the two monitor pages shared by a
/// connection, one per direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MonitorPageGpas {
    pub parent_to_child: u64,
    pub child_to_parent: u64,
}

/// What the client asks for when it initiates contact at one version.
#[derive(Copy, Clone, Debug)]
pub struct ContactRequest {
    pub version: Version,
    pub target_message_vp: u32,
    /// The SINT and VTL that server messages are delivered to.
    pub sint: u8,
    pub vtl: u8,
    pub feature_flags: FeatureFlags,
    pub monitor_page: MonitorPageGpas,
    pub client_id: Guid,
}

impl ContactRequest {
    /// The features requested on the wire, which is none before Copper.
    pub fn requested_features(&self) -> FeatureFlags {
        if self.version >= Version::Copper {
            self.feature_flags
        } else {
            FeatureFlags::new()
        }
    }

    /// Encodes the request. Only Copper and later carry the client ID.
    pub fn encode(&self) -> OutgoingMessage {
        let target_info = protocol::TargetInfo::new()
            .with_sint(self.sint)
            .with_vtl(self.vtl)
            .with_feature_flags(self.requested_features().into());
        let message = protocol::InitiateContact2 {
            initiate_contact: protocol::InitiateContact {
                version_requested: self.version as u32,
                target_message_vp: self.target_message_vp,
                interrupt_page_or_target_info: target_info.into(),
                parent_to_child_monitor_page_gpa: self.monitor_page.parent_to_child,
                child_to_parent_monitor_page_gpa: self.monitor_page.child_to_parent,
            },
            client_id: self.client_id,
        };
        if self.version >= Version::Copper {
            OutgoingMessage::new(&message)
        } else {
            OutgoingMessage::new(&message.initiate_contact)
        }
    }
}

/// A request to connect to the specified hvsocket endpoint.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct HvsockConnectRequest {
    pub service_id: Guid,
    pub endpoint_id: Guid,
    pub silo_id: Guid,
}

impl HvsockConnectRequest {
    /// Encodes the request for a connection at `version`. The silo ID is only
    /// sent from Win10Rs5 on.
    pub fn encode(&self, version: Version) -> OutgoingMessage {
        let request = protocol::TlConnectRequest2::from(*self);
        if version >= Version::Win10Rs5 {
            OutgoingMessage::new(&request)
        } else {
            OutgoingMessage::new(&request.base)
        }
    }
}

impl From<protocol::TlConnectRequest2> for HvsockConnectRequest {
    fn from(value: protocol::TlConnectRequest2) -> Self {
        Self {
            service_id: value.base.service_id,
            endpoint_id: value.base.endpoint_id,
            silo_id: value.silo_id,
        }
    }
}

impl From<HvsockConnectRequest> for protocol::TlConnectRequest2 {
    fn from(value: HvsockConnectRequest) -> Self {
        Self {
            base: protocol::TlConnectRequest {
                endpoint_id: value.endpoint_id,
                service_id: value.service_id,
            },
            silo_id: value.silo_id,
        }
    }
}
