//! Wire payloads exchanged with the bot backend.
//!
//! The backend is a JS/Express service, so every field is camelCase on the
//! wire. Request bodies are `Serialize`, response bodies `Deserialize`;
//! unknown sibling fields in responses are ignored.

use serde::{Deserialize, Serialize};

/// Body of the streaming chat call (`POST /botAsk`).
#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BotAskRequest {
    pub system_prompt: String,
    pub user_query: String,
}

/// One record decoded from a `data:` line of the response stream.
///
/// The backend may attach other fields (token counts, ids); only `content`
/// matters here.
#[derive(Deserialize)]
pub struct StreamEvent {
    pub content: Option<String>,
}

/// Body of the legacy single-shot chat call, which uses `query` instead of
/// `userQuery` and returns the whole reply at once.
#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BotQueryRequest {
    pub system_prompt: String,
    pub query: String,
}

#[derive(Deserialize)]
pub struct BotQueryResponse {
    #[serde(default)]
    pub success: bool,
    pub response: Option<String>,
    pub message: Option<String>,
}

#[derive(Serialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Serialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

/// Body of the email-verification call that completes a sign-up.
#[derive(Serialize)]
pub struct VerifyEmailRequest {
    pub code: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "isVerified", default)]
    pub is_verified: bool,
}

/// Response shape shared by `/signUp`, `/signIn` and `/check-auth`.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub user: Option<UserProfile>,
    pub token: Option<String>,
}

/// Error envelope the backend returns on non-2xx statuses.
#[derive(Deserialize)]
pub struct ApiErrorBody {
    pub message: Option<String>,
}
