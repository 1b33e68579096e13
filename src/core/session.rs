//! Session state: the ordered transcript and the exchange state machine.
//!
//! All mutation happens on the chat-loop task, as discrete reactions to a
//! submit or to one [`StreamMessage`] pulled off the stream channel. The
//! stream task only produces events, so no locking is needed.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::chat_stream::StreamMessage;
use crate::core::message::Message;

/// Reply posted when an exchange fails before any content arrived.
pub const FALLBACK_BOT_REPLY: &str = "Sorry, something went wrong. Please try again.";

/// Where the current exchange stands. Terminal outcomes are recorded on the
/// messages themselves; the phase returns to `Idle` so the next submit can
/// proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangePhase {
    /// No exchange in flight.
    Idle,
    /// User message posted, stream not yet accepted by the backend.
    UserPosted,
    /// Bot placeholder posted, no content yet.
    BotPending,
    /// At least one fragment applied to the placeholder.
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Input was empty after trimming; nothing was sent.
    Empty,
    /// A previous exchange is still streaming. New submissions are rejected
    /// rather than queued; the caller reports this and keeps the input.
    ExchangeInFlight,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Empty => write!(f, "message is empty"),
            SubmitError::ExchangeInFlight => {
                write!(f, "still waiting for the previous reply")
            }
        }
    }
}

impl std::error::Error for SubmitError {}

pub struct ChatSession {
    messages: Vec<Message>,
    system_prompt: String,
    loading: bool,
    next_id: u64,
    phase: ExchangePhase,
    current_stream_id: u64,
    cancel_token: CancellationToken,
}

impl ChatSession {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: system_prompt.into(),
            loading: false,
            next_id: 0,
            phase: ExchangePhase::Idle,
            current_stream_id: 0,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn current_stream_id(&self) -> u64 {
        self.current_stream_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Post a user message and mark the session as waiting for a reply.
    ///
    /// Returns the trimmed text to send. Rejects empty input and submissions
    /// while an exchange is still in flight; neither touches the transcript.
    pub fn submit(&mut self, input: &str) -> Result<String, SubmitError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(SubmitError::Empty);
        }
        if self.phase != ExchangePhase::Idle {
            return Err(SubmitError::ExchangeInFlight);
        }

        let id = self.alloc_id();
        self.messages.push(Message::user(id, text));
        self.loading = true;
        self.phase = ExchangePhase::UserPosted;
        Ok(text.to_string())
    }

    /// Record the id of the stream opened for the current exchange and hand
    /// out a fresh cancellation token tied to it.
    pub fn begin_stream(&mut self) -> (u64, CancellationToken) {
        self.current_stream_id += 1;
        self.cancel_token = CancellationToken::new();
        (self.current_stream_id, self.cancel_token.clone())
    }

    /// Apply one stream event. Events tagged with a superseded stream id are
    /// dropped without touching the transcript.
    pub fn apply(&mut self, message: StreamMessage, stream_id: u64) {
        if stream_id != self.current_stream_id {
            debug!(stream_id, current = self.current_stream_id, "dropping stale stream event");
            return;
        }

        match message {
            StreamMessage::Started => self.on_started(),
            StreamMessage::Chunk(fragment) => self.on_content(&fragment),
            StreamMessage::Error(detail) => self.on_error(&detail),
            StreamMessage::End => self.on_done(),
        }
    }

    fn on_started(&mut self) {
        if self.phase != ExchangePhase::UserPosted {
            return;
        }
        let id = self.alloc_id();
        self.messages.push(Message::bot_placeholder(id));
        self.phase = ExchangePhase::BotPending;
    }

    /// Append one fragment to the placeholder. Fragments compose by pure
    /// concatenation in arrival order; earlier messages are never touched.
    fn on_content(&mut self, fragment: &str) {
        match self.phase {
            ExchangePhase::BotPending | ExchangePhase::Streaming => {}
            _ => return,
        }
        if let Some(last) = self.messages.last_mut() {
            if last.streaming {
                last.text.push_str(fragment);
                self.phase = ExchangePhase::Streaming;
            }
        }
    }

    fn on_done(&mut self) {
        self.finalize_placeholder();
        self.loading = false;
        self.phase = ExchangePhase::Idle;
    }

    /// A transport failure ends the exchange with exactly one visible bot
    /// reply: the fallback text if nothing streamed yet, otherwise whatever
    /// partial text already arrived. The user's message stays.
    fn on_error(&mut self, detail: &str) {
        debug!(detail, "exchange failed");
        match self.phase {
            ExchangePhase::Idle => return,
            ExchangePhase::UserPosted => {
                let id = self.alloc_id();
                self.messages.push(Message::bot(id, FALLBACK_BOT_REPLY));
            }
            ExchangePhase::BotPending => {
                if let Some(last) = self.messages.last_mut() {
                    if last.streaming {
                        last.text.push_str(FALLBACK_BOT_REPLY);
                    }
                }
                self.finalize_placeholder();
            }
            ExchangePhase::Streaming => {
                self.finalize_placeholder();
            }
        }
        self.loading = false;
        self.phase = ExchangePhase::Idle;
    }

    /// Stop the in-flight exchange, keeping any partial reply. Used on
    /// interrupt and on teardown so the read loop stops issuing reads.
    pub fn cancel(&mut self) {
        self.cancel_token.cancel();
        if self.phase == ExchangePhase::Idle {
            return;
        }
        self.finalize_placeholder();
        self.loading = false;
        self.phase = ExchangePhase::Idle;
    }

    fn finalize_placeholder(&mut self) {
        if let Some(last) = self.messages.last_mut() {
            if last.streaming {
                last.streaming = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Sender;

    fn streamed(session: &mut ChatSession, events: &[StreamMessage]) {
        let (stream_id, _) = session.begin_stream();
        for event in events {
            session.apply(event.clone(), stream_id);
        }
    }

    #[test]
    fn empty_submit_leaves_session_untouched() {
        let mut session = ChatSession::new("");
        assert_eq!(session.submit(""), Err(SubmitError::Empty));
        assert_eq!(session.submit("   "), Err(SubmitError::Empty));
        assert!(session.messages().is_empty());
        assert!(!session.is_loading());
    }

    #[test]
    fn submit_errors_carry_user_facing_messages() {
        // The chat loop prints these verbatim when a submission is refused.
        assert_eq!(SubmitError::Empty.to_string(), "message is empty");
        assert_eq!(
            SubmitError::ExchangeInFlight.to_string(),
            "still waiting for the previous reply"
        );
    }

    #[test]
    fn submit_trims_and_posts_user_message() {
        let mut session = ChatSession::new("");
        let sent = session.submit("  Hi  ").unwrap();
        assert_eq!(sent, "Hi");
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].text, "Hi");
        assert!(session.messages()[0].is_user());
        assert!(session.is_loading());
    }

    #[test]
    fn submit_is_rejected_while_exchange_in_flight() {
        let mut session = ChatSession::new("");
        session.submit("first").unwrap();
        assert_eq!(
            session.submit("second"),
            Err(SubmitError::ExchangeInFlight)
        );
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn fragments_concatenate_in_arrival_order() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        streamed(
            &mut session,
            &[
                StreamMessage::Started,
                StreamMessage::Chunk("Hel".to_string()),
                StreamMessage::Chunk("lo,".to_string()),
                StreamMessage::Chunk(" world".to_string()),
                StreamMessage::End,
            ],
        );

        let bot = session.messages().last().unwrap();
        assert_eq!(bot.text, "Hello, world");
        assert!(!bot.streaming);
        assert!(!session.is_loading());
    }

    #[test]
    fn end_to_end_exchange() {
        let mut session = ChatSession::new("be brief");
        session.submit("Hi").unwrap();
        streamed(
            &mut session,
            &[
                StreamMessage::Started,
                StreamMessage::Chunk("Hello".to_string()),
                StreamMessage::End,
            ],
        );

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].text, "Hi");
        assert_eq!(messages[1].sender, Sender::Bot);
        assert_eq!(messages[1].text, "Hello");
        assert!(!messages[1].streaming);
        assert!(!session.is_loading());
        assert!(messages[0].id < messages[1].id);
    }

    #[test]
    fn placeholder_is_posted_empty_and_streaming() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        streamed(&mut session, &[StreamMessage::Started]);

        let bot = session.messages().last().unwrap();
        assert!(bot.is_bot());
        assert!(bot.streaming);
        assert!(bot.text.is_empty());
    }

    #[test]
    fn transport_failure_posts_exactly_one_fallback_reply() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        streamed(
            &mut session,
            &[
                StreamMessage::Error("connection refused".to_string()),
                StreamMessage::End,
            ],
        );

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "Hi");
        assert_eq!(messages[1].text, FALLBACK_BOT_REPLY);
        assert!(messages[1].is_bot());
        assert!(!messages[1].streaming);
        assert!(!session.is_loading());
    }

    #[test]
    fn failure_before_any_content_fills_the_placeholder() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        streamed(
            &mut session,
            &[
                StreamMessage::Started,
                StreamMessage::Error("reset by peer".to_string()),
                StreamMessage::End,
            ],
        );

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, FALLBACK_BOT_REPLY);
        assert!(!messages[1].streaming);
    }

    #[test]
    fn failure_mid_stream_keeps_partial_text() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        streamed(
            &mut session,
            &[
                StreamMessage::Started,
                StreamMessage::Chunk("partial".to_string()),
                StreamMessage::Error("reset by peer".to_string()),
                StreamMessage::End,
            ],
        );

        let bot = session.messages().last().unwrap();
        assert_eq!(bot.text, "partial");
        assert!(!bot.streaming);
        assert!(!session.is_loading());
    }

    #[test]
    fn stale_stream_events_are_dropped() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        let (old_id, _) = session.begin_stream();
        session.apply(StreamMessage::Started, old_id);

        let (new_id, _) = session.begin_stream();
        session.apply(StreamMessage::Chunk("stale".to_string()), old_id);
        session.apply(StreamMessage::Chunk("fresh".to_string()), new_id);

        let bot = session.messages().last().unwrap();
        assert_eq!(bot.text, "fresh");
    }

    #[test]
    fn cancel_finalizes_partial_reply() {
        let mut session = ChatSession::new("");
        session.submit("Hi").unwrap();
        streamed(
            &mut session,
            &[
                StreamMessage::Started,
                StreamMessage::Chunk("so far".to_string()),
            ],
        );
        session.cancel();

        let bot = session.messages().last().unwrap();
        assert_eq!(bot.text, "so far");
        assert!(!bot.streaming);
        assert!(!session.is_loading());
        // A fresh submit is accepted afterwards.
        assert!(session.submit("again").is_ok());
    }

    #[test]
    fn ids_strictly_increase_across_the_session() {
        let mut session = ChatSession::new("");
        session.submit("one").unwrap();
        streamed(
            &mut session,
            &[StreamMessage::Started, StreamMessage::End],
        );
        session.submit("two").unwrap();
        streamed(
            &mut session,
            &[StreamMessage::Started, StreamMessage::End],
        );

        let ids: Vec<u64> = session.messages().iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }
}
