//! Thin client for the account endpoints a running server exposes.

use log::{debug, info};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::transfer::codec::{Codec, inflate};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("server rejected registration of {0}")]
    RegistrationRejected(String),
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    edition: &'a str,
}

#[derive(Clone)]
pub struct ProfileApi {
    client: Client,
    backend_url: String,
}

impl ProfileApi {
    pub fn new(client: Client, backend_url: &str) -> Self {
        Self {
            client,
            backend_url: backend_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Session id for `username`, or `None` when the profile does not exist.
    pub async fn login(&self, username: &str) -> Result<Option<String>, ProfileError> {
        let text = self
            .post("/launcher/profile/login", &LoginRequest { username })
            .await?;
        if text.is_empty() || text.eq_ignore_ascii_case("FAILED") {
            debug!("profile: no session for {username}");
            return Ok(None);
        }
        Ok(Some(text))
    }

    pub async fn register(&self, username: &str, edition: &str) -> Result<(), ProfileError> {
        let text = self
            .post(
                "/launcher/profile/register",
                &RegisterRequest { username, edition },
            )
            .await?;
        if text.eq_ignore_ascii_case("FAILED") {
            return Err(ProfileError::RegistrationRejected(username.to_owned()));
        }
        info!("profile: registered {username} ({edition})");
        Ok(())
    }

    /// Log in, registering the profile first when it does not exist yet.
    pub async fn ensure_session(
        &self,
        username: &str,
        edition: &str,
    ) -> Result<Option<String>, ProfileError> {
        if let Some(session) = self.login(username).await? {
            return Ok(Some(session));
        }
        self.register(username, edition).await?;
        self.login(username).await
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<String, ProfileError> {
        let url = format!("{}{}", self.backend_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| ProfileError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProfileError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ProfileError::Request {
                url: url.clone(),
                source,
            })?;
        // Plain text can look like a zlib header; a failed inflate means it was plain.
        let raw = match Codec::sniff(&bytes).map(|_| inflate(&bytes)) {
            Some(Ok(inflated)) => inflated,
            Some(Err(err)) => {
                debug!("profile: {path} response is not compressed ({err})");
                bytes.to_vec()
            }
            None => bytes.to_vec(),
        };
        Ok(String::from_utf8_lossy(&raw).trim().trim_matches('"').to_owned())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    use super::*;
    use crate::testing::{Route, TestServer};

    fn zlib(text: &str) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).expect("compress");
        encoder.finish().expect("finish")
    }

    #[tokio::test]
    async fn login_inflates_compressed_session() {
        let server = TestServer::start(vec![(
            "/launcher/profile/login",
            Route::ok(zlib("\"6503f0c1a2\"")),
        )])
        .await;
        let api = ProfileApi::new(Client::new(), &server.base_url());

        let session = api.login("player").await.expect("login");
        assert_eq!(session.as_deref(), Some("6503f0c1a2"));

        let sent = server.last_body("/launcher/profile/login").expect("body");
        let sent: serde_json::Value = serde_json::from_slice(&sent).expect("json");
        assert_eq!(sent["username"], "player");
    }

    #[tokio::test]
    async fn plain_session_resembling_zlib_header_is_kept() {
        // "80" passes the zlib header check but is not a compressed stream.
        assert!(Codec::sniff(b"80ab12cd").is_some());
        let server =
            TestServer::start(vec![("/launcher/profile/login", Route::ok("80ab12cd"))]).await;
        let api = ProfileApi::new(Client::new(), &server.base_url());

        let session = api.login("player").await.expect("login");
        assert_eq!(session.as_deref(), Some("80ab12cd"));
    }

    #[tokio::test]
    async fn failed_login_is_none() {
        let server =
            TestServer::start(vec![("/launcher/profile/login", Route::ok("FAILED"))]).await;
        let api = ProfileApi::new(Client::new(), &server.base_url());
        assert_eq!(api.login("nobody").await.expect("login"), None);
    }

    #[tokio::test]
    async fn ensure_session_registers_missing_profile() {
        let server = TestServer::start(vec![
            ("/launcher/profile/login", Route::ok("FAILED")),
            ("/launcher/profile/register", Route::ok("OK")),
        ])
        .await;
        let api = ProfileApi::new(Client::new(), &server.base_url());

        let session = api
            .ensure_session("fresh", "Standard")
            .await
            .expect("ensure");
        assert_eq!(session, None);
        assert_eq!(server.hits("/launcher/profile/login"), 2);
        assert_eq!(server.hits("/launcher/profile/register"), 1);

        let sent = server.last_body("/launcher/profile/register").expect("body");
        let sent: serde_json::Value = serde_json::from_slice(&sent).expect("json");
        assert_eq!(sent["edition"], "Standard");
    }

    #[tokio::test]
    async fn server_error_is_typed() {
        let server =
            TestServer::start(vec![("/launcher/profile/login", Route::status(500))]).await;
        let api = ProfileApi::new(Client::new(), &server.base_url());
        let err = api.login("player").await.expect_err("500");
        assert!(matches!(err, ProfileError::Status { status: 500, .. }));
    }
}
