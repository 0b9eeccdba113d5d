//! WebRTC signaling relay.
//!
//! Offers, answers and ICE candidates pass through untouched: the relay
//! only looks at the optional `target` to decide who receives them.

use crate::broadcast::{ConnectionId, SessionChannel};
use crate::error::{CollabError, Result};
use crate::model::SessionId;
use crate::protocol::{Frame, FrameBody, SignalPayload};

#[derive(Debug, Default, Clone, Copy)]
pub struct SignalingRelay;

impl SignalingRelay {
    pub fn new() -> Self {
        Self
    }

    /// Relay a signaling frame from `sender`.
    ///
    /// With a target, only that user's connections receive it (`NotFound`
    /// when none is attached). Without one, an offer goes to every other
    /// connection; answers and candidates must be addressed.
    pub async fn relay(
        &self,
        channel: &SessionChannel,
        session_id: SessionId,
        sender: (ConnectionId, &str),
        body: FrameBody,
    ) -> Result<usize> {
        let (conn, user_id) = sender;
        let payload = match &body {
            FrameBody::Offer(p) | FrameBody::Answer(p) | FrameBody::IceCandidate(p) => p,
            other => {
                return Err(CollabError::Internal(format!(
                    "{} is not a signaling frame",
                    other.type_name()
                )))
            }
        };
        let target = payload.target.clone();
        let is_offer = matches!(body, FrameBody::Offer(_));
        let frame = Frame::new(body).from_user(user_id).in_session(session_id);

        match target {
            Some(target) => {
                let reached = channel.send_to_user(&target, &frame).await?;
                if reached == 0 {
                    return Err(CollabError::NotFound(format!("user {target} in this session")));
                }
                log::trace!("Relayed {} {} -> {}", frame.type_name(), user_id, target);
                Ok(reached)
            }
            None if is_offer => channel.broadcast(&frame, Some(conn)).await,
            None => Err(CollabError::invalid_frame(format!(
                "{} requires a target",
                frame.type_name()
            ))),
        }
    }
}

/// Build a signaling payload addressed to `target`.
pub fn addressed(target: impl Into<String>, data: serde_json::Value) -> SignalPayload {
    SignalPayload {
        target: Some(target.into()),
        data,
    }
}
