use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{connection::Identity, error::AuthError};

#[derive(Serialize)]
struct VerifyRequest<'a> {
    scheme: &'static str,
    credentials: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    #[serde(alias = "verify")]
    valid: bool,
    #[serde(default)]
    username: Option<String>,
}

/// Client for the external identity service.
#[derive(Clone)]
pub struct Verifier {
    client: reqwest::Client,
    url: String,
}

impl Verifier {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }

    /// Returns the username behind `token`.
    pub async fn verify(&self, token: &str) -> Result<String, AuthError> {
        let response = self
            .client
            .post(&self.url)
            .json(&VerifyRequest {
                scheme: "bearer",
                credentials: token,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Status(response.status()));
        }
        let body: VerifyResponse = response.json().await?;
        match body.username {
            Some(username) if body.valid && !username.is_empty() => Ok(username),
            _ => Err(AuthError::Rejected),
        }
    }
}

/// Resolves the player's identity. Anything short of a verified credential
/// makes them a guest.
pub async fn identify(verifier: Option<&Verifier>, token: Option<&str>) -> Identity {
    let (Some(verifier), Some(token)) = (verifier, token) else {
        return Identity::guest();
    };
    match verifier.verify(token).await {
        Ok(username) => {
            info!("{username} logged in");
            Identity::new(&username)
        }
        Err(e) => {
            debug!("falling back to guest: {e}");
            Identity::guest()
        }
    }
}
