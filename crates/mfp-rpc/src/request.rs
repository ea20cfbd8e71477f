//! Request value object and response status codes.
//!
//! A `Request` is one in-flight call. The transport drives its state; the type
//! only guarantees that a response is attached once and that the state never
//! moves backwards:
//!
//! ```text
//! Created -> Submitted -> ResponseReceived -> ResponseDone     (origin side)
//!            incoming  -> ResponsePending  -> ResponseDone     (peer side)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// Submitter-assigned id of one call/response exchange.
pub type RequestId = u64;
/// Id of a real object, valid only inside the process that owns it.
pub type RpcId = u64;
/// Id of the peer process (channel) a proxy talks to.
pub type PeerId = u32;

/// Which end of a duplex pipe this process holds.
///
/// The role doubles as the wire `origin` of the requests an endpoint submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Slave,
    Master,
}

impl Role {
    pub fn origin(&self) -> u8 {
        match self {
            Role::Slave => 0,
            Role::Master => 1,
        }
    }

    pub fn from_origin(origin: u8) -> Option<Self> {
        match origin {
            0 => Some(Role::Slave),
            1 => Some(Role::Master),
            _ => None,
        }
    }

    /// The role of the other end.
    pub fn peer(&self) -> Self {
        match self {
            Role::Slave => Role::Master,
            Role::Master => Role::Slave,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Slave => write!(f, "slave"),
            Role::Master => write!(f, "master"),
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Submitted,
    /// Peer side: received, waiting for local execution.
    ResponsePending,
    /// Origin side: the response has been delivered.
    ResponseReceived,
    /// Terminal.
    ResponseDone,
}

impl RequestState {
    fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Submitted, ResponseReceived)
                | (ResponsePending, ResponseDone)
                | (ResponseReceived, ResponseDone)
        )
    }
}

/// Out-of-band signals carried in place of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Quit,
}

/// What a request asks for: a method call, or a bare signal such as `"quit"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Call {
        method: String,
        #[serde(default)]
        params: Value,
    },
    Signal(Signal),
}

impl Payload {
    pub fn call(method: impl Into<String>, params: Value) -> Self {
        Payload::Call {
            method: method.into(),
            params,
        }
    }

    pub fn is_quit(&self) -> bool {
        matches!(self, Payload::Signal(Signal::Quit))
    }
}

/// Status half of a response.
///
/// On the wire this is a bare integer or boolean: the four fixed negative
/// codes, a freshly allocated rpcid (`create`), or `true` (`delete`, `publish`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStatus", into = "RawStatus")]
pub enum Status {
    NoClass,
    NoMethod,
    MethodFailed,
    MethodOk,
    Created(RpcId),
    Ack,
}

impl Status {
    pub const NO_CLASS: i64 = -1;
    pub const NO_METHOD: i64 = -2;
    pub const METHOD_FAILED: i64 = -3;
    pub const METHOD_OK: i64 = -4;
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawStatus {
    Flag(bool),
    Code(i64),
}

impl From<Status> for RawStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::NoClass => RawStatus::Code(Status::NO_CLASS),
            Status::NoMethod => RawStatus::Code(Status::NO_METHOD),
            Status::MethodFailed => RawStatus::Code(Status::METHOD_FAILED),
            Status::MethodOk => RawStatus::Code(Status::METHOD_OK),
            Status::Created(rpcid) => RawStatus::Code(rpcid as i64),
            Status::Ack => RawStatus::Flag(true),
        }
    }
}

impl TryFrom<RawStatus> for Status {
    type Error = String;

    fn try_from(raw: RawStatus) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawStatus::Flag(true) => Ok(Status::Ack),
            RawStatus::Flag(false) => Err("status flag must be true".to_string()),
            RawStatus::Code(Status::NO_CLASS) => Ok(Status::NoClass),
            RawStatus::Code(Status::NO_METHOD) => Ok(Status::NoMethod),
            RawStatus::Code(Status::METHOD_FAILED) => Ok(Status::MethodFailed),
            RawStatus::Code(Status::METHOD_OK) => Ok(Status::MethodOk),
            RawStatus::Code(n) if n >= 0 => Ok(Status::Created(n as RpcId)),
            RawStatus::Code(n) => Err(format!("unknown status code {}", n)),
        }
    }
}

/// `(status, value)` pair, serialized as a two-element array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response(pub Status, pub Value);

impl Response {
    pub fn new(status: Status, value: Value) -> Self {
        Self(status, value)
    }

    pub fn status(&self) -> Status {
        self.0
    }

    pub fn value(&self) -> &Value {
        &self.1
    }

    pub fn into_value(self) -> Value {
        self.1
    }
}

/// Invoked with the request once its response has been delivered.
pub type ResponseCallback = Box<dyn FnOnce(&Request) + Send + Sync>;

/// One in-flight call.
pub struct Request {
    request_id: Option<RequestId>,
    payload: Payload,
    response: Option<Response>,
    state: RequestState,
    callback: Option<ResponseCallback>,
}

impl Request {
    /// A call that has not been submitted yet.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self::with_payload(Payload::call(method, params))
    }

    /// The shutdown sentinel.
    pub fn quit() -> Self {
        Self::with_payload(Payload::Signal(Signal::Quit))
    }

    pub fn with_payload(payload: Payload) -> Self {
        Self {
            request_id: None,
            payload,
            response: None,
            state: RequestState::Created,
            callback: None,
        }
    }

    /// A call received from the peer, awaiting local execution.
    pub fn incoming(request_id: RequestId, payload: Payload) -> Self {
        Self {
            request_id: Some(request_id),
            payload,
            response: None,
            state: RequestState::ResponsePending,
            callback: None,
        }
    }

    /// Run `callback` when the response is delivered, before the caller wakes.
    pub fn on_response(mut self, callback: impl FnOnce(&Request) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn method(&self) -> Option<&str> {
        match &self.payload {
            Payload::Call { method, .. } => Some(method),
            Payload::Signal(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Call { params, .. } => Some(params),
            Payload::Signal(_) => None,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<Response> {
        self.response
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_quit(&self) -> bool {
        self.payload.is_quit()
    }

    /// Attach the response. A request is answered at most once.
    pub fn set_response(&mut self, response: Response) -> Result<()> {
        if self.response.is_some() {
            return Err(RpcError::ResponseAlreadySet {
                request_id: self.request_id,
            });
        }
        self.response = Some(response);
        Ok(())
    }

    /// Move to `next`. Only the forward edges of the lifecycle are accepted.
    pub fn advance(&mut self, next: RequestState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(RpcError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn assign_id(&mut self, request_id: RequestId) {
        self.request_id = Some(request_id);
    }

    pub(crate) fn replace_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub(crate) fn take_callback(&mut self) -> Option<ResponseCallback> {
        self.callback.take()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("payload", &self.payload)
            .field("response", &self.response)
            .field("state", &self.state)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
