//! Account calls and bearer-token persistence.
//!
//! Sign-up and sign-in are opaque remote calls returning a user object and a
//! token; the token is stored in the system keyring under a single well-known
//! entry and attached as a bearer header on later requests. The chat core
//! itself does not depend on any of this beyond receiving the token.

use keyring::Entry;
use tracing::warn;

use crate::api::{
    ApiErrorBody, AuthResponse, BotQueryRequest, BotQueryResponse, SignInRequest, SignUpRequest,
    UserProfile, VerifyEmailRequest,
};
use crate::utils::url::construct_api_url;

const KEYRING_SERVICE: &str = "charla";
const TOKEN_ENTRY: &str = "auth-token";

type BoxedError = Box<dyn std::error::Error>;

/// Pull the server's `message` out of a failed response, falling back to the
/// status line when the body is not the usual envelope.
async fn response_error(response: reqwest::Response, fallback: &str) -> BoxedError {
    let status = response.status();
    let message = response
        .text()
        .await
        .ok()
        .and_then(|body| serde_json::from_str::<ApiErrorBody>(&body).ok())
        .and_then(|body| body.message);
    match message {
        Some(message) if !message.is_empty() => message.into(),
        _ => format!("{fallback} ({status})").into(),
    }
}

pub struct AuthClient {
    client: reqwest::Client,
    base_url: String,
    use_keyring: bool,
}

impl AuthClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self::new_with_keyring(client, base_url, true)
    }

    /// Construct an AuthClient, optionally disabling keyring access (useful
    /// for tests and headless environments).
    pub fn new_with_keyring(
        client: reqwest::Client,
        base_url: impl Into<String>,
        use_keyring: bool,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            use_keyring,
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        name: &str,
        password: &str,
    ) -> Result<AuthResponse, BoxedError> {
        let url = construct_api_url(&self.base_url, "signUp");
        let response = self
            .client
            .post(url)
            .json(&SignUpRequest {
                email: email.to_string(),
                password: password.to_string(),
                name: name.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(response_error(response, "An error occurred during sign up").await);
        }
        Ok(response.json().await?)
    }

    /// Submit the emailed verification code that completes a sign-up.
    /// Accounts stay rejected by [`Self::sign_in`] until this succeeds.
    pub async fn verify_email(&self, code: &str) -> Result<AuthResponse, BoxedError> {
        if code.trim().is_empty() {
            return Err("a verification code is required".into());
        }

        let url = construct_api_url(&self.base_url, "verify-email");
        let response = self
            .client
            .post(url)
            .json(&VerifyEmailRequest {
                code: code.trim().to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(
                response_error(response, "An error occurred during email verification").await,
            );
        }
        Ok(response.json().await?)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthResponse, BoxedError> {
        let url = construct_api_url(&self.base_url, "signIn");
        let response = self
            .client
            .post(url)
            .json(&SignInRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(response_error(response, "An error occurred during sign in").await);
        }

        let auth: AuthResponse = response.json().await?;
        if let Some(user) = &auth.user {
            if !user.is_verified {
                return Err(
                    "Account not verified. Please check your email for verification instructions."
                        .into(),
                );
            }
        }
        Ok(auth)
    }

    pub async fn check_auth(&self, token: &str) -> Result<UserProfile, BoxedError> {
        let url = construct_api_url(&self.base_url, "check-auth");
        let response = self.client.get(url).bearer_auth(token).send().await?;

        if !response.status().is_success() {
            return Err(response_error(response, "Authentication check failed").await);
        }

        let auth: AuthResponse = response.json().await?;
        auth.user.ok_or_else(|| "no user in response".into())
    }

    /// Legacy single-shot chat call. Uses the `{systemPrompt, query}` body
    /// shape, unlike the streaming call's `{systemPrompt, userQuery}`; the
    /// two are historical variants of the same endpoint and are kept apart
    /// deliberately.
    pub async fn bot_query(
        &self,
        system_prompt: &str,
        query: &str,
    ) -> Result<String, BoxedError> {
        if query.trim().is_empty() {
            return Err("a query is required".into());
        }

        let url = construct_api_url(&self.base_url, "botAsk");
        let mut request = self.client.post(url).json(&BotQueryRequest {
            system_prompt: system_prompt.to_string(),
            query: query.to_string(),
        });
        if let Some(token) = self.stored_token() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(response_error(response, "Bot query failed").await);
        }

        let body: BotQueryResponse = response.json().await?;
        if body.success {
            body.response.ok_or_else(|| "no response in body".into())
        } else {
            Err(body
                .message
                .unwrap_or_else(|| "Bot query failed".to_string())
                .into())
        }
    }

    fn token_entry(&self) -> Result<Entry, BoxedError> {
        Ok(Entry::new(KEYRING_SERVICE, TOKEN_ENTRY)?)
    }

    pub fn store_token(&self, token: &str) -> Result<(), BoxedError> {
        if !self.use_keyring {
            return Ok(());
        }
        self.token_entry()?.set_password(token)?;
        Ok(())
    }

    /// The persisted token, if any. Keyring outages are logged and treated
    /// as "not signed in" so startup can fall back to the anonymous flow.
    pub fn stored_token(&self) -> Option<String> {
        if !self.use_keyring {
            return None;
        }
        let entry = match self.token_entry() {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "keyring unavailable");
                return None;
            }
        };
        match entry.get_password() {
            Ok(token) => Some(token),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(error = %e, "could not read stored token");
                None
            }
        }
    }

    pub fn clear_token(&self) -> Result<(), BoxedError> {
        if !self.use_keyring {
            return Ok(());
        }
        match self.token_entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
