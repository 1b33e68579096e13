use serde::{Deserialize, Serialize};

/// Originator of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }

    pub fn is_user(self) -> bool {
        self == Sender::User
    }

    pub fn is_bot(self) -> bool {
        self == Sender::Bot
    }
}

impl AsRef<str> for Sender {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Sender {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Sender::User),
            "bot" => Ok(Sender::Bot),
            _ => Err(format!("invalid sender: {value}")),
        }
    }
}

impl TryFrom<String> for Sender {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Sender> for String {
    fn from(value: Sender) -> Self {
        value.as_str().to_string()
    }
}

/// One entry in the session transcript.
///
/// Ids are allocated by the owning session and strictly increase in append
/// order, so they double as list keys and recency markers. `streaming` is
/// true only for the bot reply currently being filled in; the session
/// guarantees at most one such message exists and that it is the last bot
/// message appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub text: String,
    pub sender: Sender,
    pub streaming: bool,
}

impl Message {
    pub fn user(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            sender: Sender::User,
            streaming: false,
        }
    }

    pub fn bot(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            sender: Sender::Bot,
            streaming: false,
        }
    }

    /// An empty bot reply that will be filled incrementally by the stream.
    pub fn bot_placeholder(id: u64) -> Self {
        Self {
            id,
            text: String::new(),
            sender: Sender::Bot,
            streaming: true,
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender.is_user()
    }

    pub fn is_bot(&self) -> bool {
        self.sender.is_bot()
    }
}
