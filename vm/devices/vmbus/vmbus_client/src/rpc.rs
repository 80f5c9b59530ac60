// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request/response plumbing between the client handles and the client task.

use futures::channel::mpsc;
use futures::channel::oneshot;

/// A request carrying an input and a channel for the response.
#[derive(Debug)]
pub(crate) struct Rpc<I, R> {
    input: I,
    response: RpcResponse<R>,
}

/// The response half of an [`Rpc`], once its input has been taken.
#[derive(Debug)]
pub(crate) struct RpcResponse<R>(oneshot::Sender<R>);

/// The task that handles requests is gone.
#[derive(Debug)]
pub(crate) struct TaskGone;

impl<I, R> Rpc<I, R> {
    pub fn new(input: I) -> (Self, oneshot::Receiver<R>) {
        let (send, recv) = oneshot::channel();
        (
            Self {
                input,
                response: RpcResponse(send),
            },
            recv,
        )
    }

    pub fn input(&self) -> &I {
        &self.input
    }

    pub fn split(self) -> (I, RpcResponse<R>) {
        (self.input, self.response)
    }

    pub fn complete(self, value: R) {
        self.response.complete(value)
    }
}

impl<R> RpcResponse<R> {
    /// Sends the response. The caller may have stopped waiting, which is not
    /// an error.
    pub fn complete(self, value: R) {
        let _ = self.0.send(value);
    }
}

/// Sends `input` to the task as the request built by `f` and waits for the
/// response.
pub(crate) async fn call<T, I, R>(
    send: &mpsc::UnboundedSender<T>,
    f: impl FnOnce(Rpc<I, R>) -> T,
    input: I,
) -> Result<R, TaskGone> {
    let (rpc, recv) = Rpc::new(input);
    send.unbounded_send(f(rpc)).map_err(|_| TaskGone)?;
    recv.await.map_err(|_| TaskGone)
}
