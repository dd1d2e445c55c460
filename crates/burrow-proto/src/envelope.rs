//! Envelope constructors and an exhaustive view over inbound envelopes.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::v1::{
    ControlMessage, Envelope, HttpExchangeRequest, HttpExchangeResponse, MessageType,
    envelope::Payload,
};

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn stamped(kind: MessageType, payload: Option<Payload>) -> Envelope {
    Envelope {
        message_id: uuid::Uuid::new_v4().to_string(),
        r#type: kind as i32,
        timestamp_ms: now_ms(),
        payload,
    }
}

impl Envelope {
    /// Wrap a request for delivery to an agent.
    pub fn request(req: HttpExchangeRequest) -> Self {
        stamped(MessageType::Request, Some(Payload::Request(req)))
    }

    /// Wrap a response for delivery to the broker.
    pub fn response(resp: HttpExchangeResponse) -> Self {
        stamped(MessageType::Response, Some(Payload::Response(resp)))
    }

    /// Liveness signal carrying no payload.
    pub fn heartbeat() -> Self {
        stamped(MessageType::Heartbeat, None)
    }

    /// Named control command with free-form data.
    pub fn control(command: impl Into<String>, data: impl Into<String>) -> Self {
        stamped(
            MessageType::Control,
            Some(Payload::Control(ControlMessage {
                command: command.into(),
                data: data.into(),
            })),
        )
    }

    /// Consume the envelope and classify it.
    ///
    /// The declared `type` decides the variant. A payload that does not match
    /// the declared type yields [`EnvelopeKind::Malformed`].
    pub fn into_kind(self) -> EnvelopeKind {
        match MessageType::try_from(self.r#type) {
            Ok(MessageType::Request) => match self.payload {
                Some(Payload::Request(req)) => EnvelopeKind::Request(req),
                _ => EnvelopeKind::Malformed(MessageType::Request),
            },
            Ok(MessageType::Response) => match self.payload {
                Some(Payload::Response(resp)) => EnvelopeKind::Response(resp),
                _ => EnvelopeKind::Malformed(MessageType::Response),
            },
            Ok(MessageType::Heartbeat) => EnvelopeKind::Heartbeat,
            Ok(MessageType::Control) => match self.payload {
                Some(Payload::Control(ctl)) => EnvelopeKind::Control(ctl),
                _ => EnvelopeKind::Malformed(MessageType::Control),
            },
            Ok(MessageType::Unspecified) | Err(_) => EnvelopeKind::Unrecognized(self.r#type),
        }
    }
}

/// What an inbound envelope turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeKind {
    Request(HttpExchangeRequest),
    Response(HttpExchangeResponse),
    Heartbeat,
    Control(ControlMessage),
    /// Declared type whose payload is missing or of the wrong kind.
    Malformed(MessageType),
    /// Unspecified or unknown `type` value.
    Unrecognized(i32),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn constructors_stamp_id_and_time() {
        let before = now_ms();
        let a = Envelope::heartbeat();
        let b = Envelope::heartbeat();
        assert_ne!(a.message_id, b.message_id);
        assert!(uuid::Uuid::parse_str(&a.message_id).is_ok());
        assert!(a.timestamp_ms >= before);
        assert_eq!(a.r#type, MessageType::Heartbeat as i32);
        assert!(a.payload.is_none());
    }

    #[test]
    fn request_round_trips_through_kind() {
        let req = HttpExchangeRequest {
            request_id: "r-1".into(),
            method: "GET".into(),
            path: "/a?b=1".into(),
            ..Default::default()
        };
        match Envelope::request(req.clone()).into_kind() {
            EnvelopeKind::Request(got) => assert_eq!(got, req),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn control_carries_command_and_data() {
        let kind = Envelope::control("health_check", "").into_kind();
        match kind {
            EnvelopeKind::Control(ctl) => {
                assert_eq!(ctl.command, "health_check");
                assert!(ctl.data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mismatched_payload_is_malformed() {
        let mut env = Envelope::heartbeat();
        env.r#type = MessageType::Response as i32;
        assert_eq!(
            env.into_kind(),
            EnvelopeKind::Malformed(MessageType::Response)
        );
    }

    #[test]
    fn unknown_and_unspecified_types_are_unrecognized() {
        let mut env = Envelope::heartbeat();
        env.r#type = 42;
        assert_eq!(env.into_kind(), EnvelopeKind::Unrecognized(42));

        let mut env = Envelope::heartbeat();
        env.r#type = 0;
        assert_eq!(env.into_kind(), EnvelopeKind::Unrecognized(0));
    }
}
