use super::{PealApp, ServerError};
use crate::util::generate_id;
use peal_proto::signal::{ChatSend, ChatTyping, MessageRead};
use peal_proto::{ControlEnvelope, Frame, FrameType};
use peal_storage::NewMessage;
use serde_json::json;
use std::convert::TryFrom;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Message bodies are stored trimmed; whitespace-only content is invalid.
fn sanitize_content(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Linear backoff between persistence attempts.
fn retry_delay(step_ms: u64, attempt: u32) -> StdDuration {
    StdDuration::from_millis(step_ms * u64::from(attempt))
}

impl PealApp {
    pub(crate) async fn handle_chat_send(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(send) = ChatSend::try_from(envelope) else {
            self.reject_invalid(tx_out, server_sequence, "chat_message", "invalid chat message")
                .await;
            return Ok(());
        };
        let valid_parties =
            !send.to.trim().is_empty() && !send.from.trim().is_empty() && send.from == user_id;
        let Some(content) = sanitize_content(&send.content).filter(|_| valid_parties) else {
            self.reject_invalid(tx_out, server_sequence, "chat_message", "invalid chat message")
                .await;
            return Ok(());
        };
        let message = NewMessage {
            message_id: generate_id(&format!("msg:{}:{}", send.from, send.to)),
            sender: send.from.clone(),
            receiver: send.to.clone(),
            content: content.to_string(),
        };
        let attempts = self.state.config.chat_retry_attempts;
        let backoff = self.state.config.chat_retry_backoff_ms;
        let mut stored = None;
        let mut attempt = 0u32;
        while attempt < attempts && stored.is_none() {
            match self.state.storage.create_message(&message).await {
                Ok(record) => stored = Some(record),
                Err(err) => {
                    attempt += 1;
                    self.state.metrics.mark_chat_retry();
                    warn!(
                        attempt,
                        sender = %message.sender,
                        error = %err,
                        "chat persistence attempt failed"
                    );
                    if attempt < attempts {
                        sleep(retry_delay(backoff, attempt)).await;
                    }
                }
            }
        }
        let Some(record) = stored else {
            self.state.metrics.mark_chat_failure();
            self.send_event_error(
                tx_out,
                server_sequence,
                "chat_message",
                "failed to send message after retries",
            )
            .await;
            return Ok(());
        };
        self.state.metrics.mark_chat_message();
        self.state
            .deliver_to_user(
                &record.receiver,
                FrameType::ChatMessage,
                json!({
                    "message_id": record.message_id.clone(),
                    "sender": record.sender.clone(),
                    "receiver": record.receiver.clone(),
                    "content": record.content.clone(),
                    "delivered": record.delivered,
                    "read": record.read,
                    "created_at": record.created_at.to_rfc3339(),
                }),
            )
            .await;
        self.send_self_frame(
            tx_out,
            server_sequence,
            FrameType::Ack,
            json!({ "message_id": record.message_id.clone() }),
        )
        .await;
        self.state.spawn_push(
            record.receiver.clone(),
            "New message".to_string(),
            format!("{}: {}", record.sender, record.content),
            json!({
                "message_id": record.message_id,
                "from": record.sender,
            }),
        );
        Ok(())
    }

    pub(crate) async fn handle_typing(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        stop: bool,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let event = if stop { "chat_stop_typing" } else { "chat_typing" };
        let Ok(typing) = ChatTyping::try_from(envelope) else {
            self.reject_invalid(tx_out, server_sequence, event, "invalid typing event")
                .await;
            return Ok(());
        };
        if typing.to.trim().is_empty() || typing.from.trim().is_empty() || typing.from != user_id {
            self.reject_invalid(tx_out, server_sequence, event, "invalid typing event")
                .await;
            return Ok(());
        }
        let frame_type = if stop {
            FrameType::ChatStopTyping
        } else {
            FrameType::ChatTyping
        };
        self.state
            .deliver_to_user(&typing.to, frame_type, json!({ "from": typing.from }))
            .await;
        Ok(())
    }

    pub(crate) async fn handle_message_read(
        &self,
        user_id: &str,
        envelope: &ControlEnvelope,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        let Ok(read) = MessageRead::try_from(envelope) else {
            self.reject_invalid(
                tx_out,
                server_sequence,
                "message_read",
                "invalid message read event",
            )
            .await;
            return Ok(());
        };
        if read.message_id.trim().is_empty() {
            self.reject_invalid(
                tx_out,
                server_sequence,
                "message_read",
                "invalid message read event",
            )
            .await;
            return Ok(());
        }
        match self.state.storage.mark_message_read(&read.message_id).await {
            Ok(matched) => {
                if let Some(record) = &matched {
                    info!(message = %record.message_id, reader = %user_id, "message read");
                    if record.sender != user_id {
                        self.state
                            .deliver_to_user(
                                &record.sender,
                                FrameType::MessageRead,
                                json!({
                                    "message_id": record.message_id.clone(),
                                    "reader": record.receiver.clone(),
                                }),
                            )
                            .await;
                    }
                }
                // the requester is acknowledged even when no record matched
                self.send_self_frame(
                    tx_out,
                    server_sequence,
                    FrameType::MessageRead,
                    json!({ "message_id": read.message_id }),
                )
                .await;
            }
            Err(err) => {
                error!(message = %read.message_id, error = %err, "message read persistence failed");
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    "message_read",
                    "failed to mark message as read",
                )
                .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_trimmed_before_storage() {
        assert_eq!(sanitize_content("  hello  "), Some("hello"));
        assert_eq!(sanitize_content("hi"), Some("hi"));
    }

    #[test]
    fn whitespace_only_content_is_invalid() {
        assert_eq!(sanitize_content(""), None);
        assert_eq!(sanitize_content("   "), None);
        assert_eq!(sanitize_content("\n\t"), None);
    }

    #[test]
    fn retry_delay_grows_linearly() {
        assert_eq!(retry_delay(100, 1), StdDuration::from_millis(100));
        assert_eq!(retry_delay(100, 2), StdDuration::from_millis(200));
        assert_eq!(retry_delay(50, 3), StdDuration::from_millis(150));
    }
}
