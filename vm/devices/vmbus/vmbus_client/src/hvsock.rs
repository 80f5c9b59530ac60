// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::OfferInfo;
use crate::rpc::Rpc;
use vmbus_core::HvsockConnectRequest;
use vmbus_core::protocol;

/// Tracks hvsocket connect requests that the remote has not answered yet.
pub(crate) struct HvsockRequestTracker {
    pending_requests: Vec<Request>,
}

pub(crate) type Request = Rpc<HvsockConnectRequest, Option<OfferInfo>>;

impl HvsockRequestTracker {
    pub fn new() -> Self {
        Self {
            pending_requests: Vec::new(),
        }
    }

    pub fn add_request(&mut self, request: Request) {
        self.pending_requests.push(request);
    }

    /// Fails every outstanding request. Used when the connection goes away.
    pub fn clear(&mut self) {
        for request in self.pending_requests.drain(..) {
            request.complete(None);
        }
    }

    /// Checks if a failure result from the remote matches a request, and if so
    /// removes it.
    pub fn check_result(&mut self, result: &protocol::TlConnectResult) -> Option<Request> {
        // Success is reported with an offer, never with a result message.
        if result.status >= 0 {
            tracing::warn!(
                status = result.status,
                "protocol violation: unexpected tl connect result success status"
            );
            return None;
        }
        if let Some(index) = self.pending_requests.iter().position(|request| {
            request.input().service_id == result.service_id
                && request.input().endpoint_id == result.endpoint_id
        }) {
            Some(self.pending_requests.swap_remove(index))
        } else {
            tracing::warn!(?result, "result for unknown hvsock request");
            None
        }
    }

    /// Checks if an offer from the remote answers a request, and if so removes
    /// the request.
    pub fn check_offer(&mut self, offer: &protocol::OfferChannel) -> Option<Request> {
        if !offer.flags.tlnpi_provider() || offer.user_defined.hvsock_is_for_guest_accept() {
            return None;
        }

        // The silo ID is not echoed back in the offer, so it is not checked.
        let index = self.pending_requests.iter().position(|request| {
            request.input().service_id == offer.interface_id
                && request.input().endpoint_id == offer.instance_id
        })?;

        let rpc = self.pending_requests.swap_remove(index);
        tracing::debug!(request = ?rpc.input(), "channel offer matches hvsocket request");
        Some(rpc)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending_requests.len()
    }
}
