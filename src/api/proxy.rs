// Plain HTTP client for a function's proxy endpoint.
#![allow(clippy::result_large_err)]

use std::thread;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::warn;
use url::Url;

use crate::core::error::{Error, ErrorKind};

pub const TOKEN_ENV: &str = "TETHER_TOKEN";

pub struct ProxyClient {
    agent: ureq::Agent,
    token: Option<String>,
    token_from_env: bool,
    retries: u32,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(10))
                .build(),
            token: None,
            token_from_env: true,
            retries: 0,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Require an explicit token instead of falling back to `TETHER_TOKEN`.
    pub fn without_env_fallback(mut self) -> Self {
        self.token_from_env = false;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn token(&self) -> Result<String, Error> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        self.token_from_env
            .then(|| std::env::var(TOKEN_ENV).ok())
            .flatten()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                Error::new(ErrorKind::Config)
                    .with_message("no token available for the proxy endpoint")
                    .with_hint(format!("Set {TOKEN_ENV} or pass a token to the client."))
            })
    }

    /// POST `{"args", "kwargs"}` to `url` and return the decoded body. Anything but a
    /// 200 is a transport failure carrying the response text.
    pub fn call(&self, url: &Url, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value, Error> {
        let token = self.token()?;
        let payload = json!({ "args": args, "kwargs": kwargs }).to_string();
        let mut attempt = 0;
        let response = loop {
            let sent = self
                .agent
                .post(url.as_str())
                .set("Authorization", &format!("Bearer {token}"))
                .set("Content-Type", "application/json")
                .send_string(&payload);
            match sent {
                Ok(response) => break response,
                Err(ureq::Error::Status(code, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message(format!("proxy call failed with status {code}: {body}")));
                }
                Err(ureq::Error::Transport(err)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(url = %url, attempt, error = %err, "proxy call failed, retrying");
                    thread::sleep(Duration::from_millis(200) * attempt);
                }
                Err(ureq::Error::Transport(err)) => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message("proxy call failed")
                        .with_source(err));
                }
            }
        };

        let status = response.status();
        let body = response.into_string().map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to read proxy response")
                .with_source(err)
        })?;
        if status != 200 {
            return Err(Error::new(ErrorKind::Transport)
                .with_message(format!("proxy call failed with status {status}: {body}")));
        }
        serde_json::from_str(&body).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("proxy response was not json")
                .with_source(err)
        })
    }
}
