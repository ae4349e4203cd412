//! dpsync device: typed request/reply channel to the dataplane.
//!
//! The wire encoding belongs to whatever implements [`RawChannel`]; this
//! crate only fixes the contract: one synchronous call at a time per
//! channel, replies carry a numeric return code, non-zero means the device
//! refused the command.

#![forbid(unsafe_code)]

use std::time::Instant;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{message} returned {retval}")]
    Retval { message: &'static str, retval: i32 },
    #[error("transport: {0}")]
    Transport(String),
    #[error("codec for {message}: {source}")]
    Codec {
        message: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Reply half of a device command.
pub trait Reply: DeserializeOwned {
    fn retval(&self) -> i32;
}

/// Request half of a device command.
pub trait Message: Serialize + std::fmt::Debug {
    const NAME: &'static str;
    type Reply: Reply;
}

/// Reply carrying nothing but the return code.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RetvalReply {
    pub retval: i32,
}

impl Reply for RetvalReply {
    fn retval(&self) -> i32 { self.retval }
}

/// Untyped command path implemented by transports.
pub trait RawChannel: Send {
    fn call(&mut self, message: &'static str, payload: Json) -> Result<Json, ChannelError>;
}

/// Source of independent channels to one device.
pub trait Connection: Send + Sync {
    fn new_channel(&self) -> Result<Channel, ChannelError>;
}

/// Typed channel. Owned by exactly one descriptor.
pub struct Channel {
    raw: Box<dyn RawChannel>,
}

impl Channel {
    pub fn new(raw: impl RawChannel + 'static) -> Self { Self { raw: Box::new(raw) } }

    /// Send `msg` and wait for its reply. A non-zero return code is an error.
    pub fn send_request<M: Message>(&mut self, msg: &M) -> Result<M::Reply, ChannelError> {
        let started = Instant::now();
        let payload = serde_json::to_value(msg).map_err(|source| ChannelError::Codec { message: M::NAME, source })?;
        let raw = self.raw.call(M::NAME, payload);
        metrics::histogram!("device_call_ms", started.elapsed().as_secs_f64() * 1000.0, "message" => M::NAME);
        let raw = match raw {
            Ok(v) => v,
            Err(e) => {
                metrics::counter!("device_call_err", 1, "message" => M::NAME);
                return Err(e);
            }
        };
        let reply: M::Reply = serde_json::from_value(raw).map_err(|source| ChannelError::Codec { message: M::NAME, source })?;
        let retval = reply.retval();
        if retval != 0 {
            metrics::counter!("device_call_err", 1, "message" => M::NAME);
            debug!(message = M::NAME, retval, "device refused command");
            return Err(ChannelError::Retval { message: M::NAME, retval });
        }
        debug!(message = M::NAME, "device command ok");
        Ok(reply)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("Channel") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug, Deserialize)]
    struct PingReply {
        retval: i32,
        seq: u32,
    }

    impl Reply for PingReply {
        fn retval(&self) -> i32 { self.retval }
    }

    impl Message for Ping {
        const NAME: &'static str = "ping";
        type Reply = PingReply;
    }

    struct Echo {
        retval: i32,
        calls: Vec<&'static str>,
    }

    impl RawChannel for Echo {
        fn call(&mut self, message: &'static str, payload: Json) -> Result<Json, ChannelError> {
            self.calls.push(message);
            Ok(serde_json::json!({ "retval": self.retval, "seq": payload["seq"] }))
        }
    }

    struct Down;

    impl RawChannel for Down {
        fn call(&mut self, _message: &'static str, _payload: Json) -> Result<Json, ChannelError> {
            Err(ChannelError::Transport("socket closed".into()))
        }
    }

    #[test]
    fn typed_reply_roundtrip() {
        let mut ch = Channel::new(Echo { retval: 0, calls: vec![] });
        let r = ch.send_request(&Ping { seq: 9 }).unwrap();
        assert_eq!(r.seq, 9);
    }

    #[test]
    fn nonzero_retval_is_error() {
        let mut ch = Channel::new(Echo { retval: -2, calls: vec![] });
        let e = ch.send_request(&Ping { seq: 1 }).unwrap_err();
        assert_eq!(e.to_string(), "ping returned -2");
    }

    #[test]
    fn transport_failure_propagates() {
        let mut ch = Channel::new(Down);
        assert!(matches!(ch.send_request(&Ping { seq: 1 }), Err(ChannelError::Transport(_))));
    }
}
