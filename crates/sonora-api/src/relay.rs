// Relay HTTP client
//
// One method per relay route. Status codes are validated here so callers
// only ever see typed errors; nothing in this module retries or keeps
// session state.

use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::LOCATION;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::protocol::{Command, CommandAccepted, RelayEvent, VERSION_HEADER, validate_version};
use crate::transport::TransportConfig;

/// Live, typed session event stream. Ends when the relay closes the socket.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RelayEvent, Error>> + Send>>;

/// Result of `POST /register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Opaque client identifier, persisted by callers for reconnection.
    pub client_id: String,
    /// Session path from the `Location` header, e.g. `/api/{client_id}`.
    pub location: String,
}

/// Raw HTTP client for a sonora relay.
///
/// `base_url` is the relay mount point, e.g. `http://host:3000/api`.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl RelayClient {
    /// Create a client from a `TransportConfig`.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            base_url,
            request_timeout: transport.request_timeout,
        })
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            request_timeout: TransportConfig::default().request_timeout,
        }
    }

    /// The relay mount point.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// `{base}/{path}`
    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let full = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path);
        Ok(Url::parse(&full)?)
    }

    /// `{origin}{location}/{suffix}`: session routes hang off the path the
    /// relay handed out at registration.
    fn session_url(&self, location: &str, suffix: &str) -> Result<Url, Error> {
        let path = format!("{}/{}", location.trim_end_matches('/'), suffix);
        Ok(self.base_url.join(&path)?)
    }

    fn client_endpoint(&self, client_id: &str, suffix: &str) -> Result<Url, Error> {
        self.endpoint(&format!("{client_id}/{suffix}"))
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// `GET /version`: expects `204` and a valid version header.
    pub async fn version(&self) -> Result<String, Error> {
        let url = self.endpoint("version")?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if resp.status() != StatusCode::NO_CONTENT {
            return Err(Error::UnexpectedStatus {
                endpoint: "version",
                status: resp.status().as_u16(),
            });
        }

        let version = resp
            .headers()
            .get(VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingVersion)?
            .to_string();
        validate_version(&version)?;
        Ok(version)
    }

    /// `POST /register[/{previous}]`: expects `201` and a `Location` header.
    pub async fn register(&self, previous_client_id: Option<&str>) -> Result<Registration, Error> {
        let url = match previous_client_id {
            Some(id) => self.endpoint(&format!("register/{id}"))?,
            None => self.endpoint("register")?,
        };
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        if resp.status() != StatusCode::CREATED {
            return Err(Error::UnexpectedStatus {
                endpoint: "register",
                status: resp.status().as_u16(),
            });
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::MissingLocation)?
            .to_string();
        let client_id = location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingLocation)?
            .to_string();

        Ok(Registration {
            client_id,
            location,
        })
    }

    /// `POST /{client_id}/unregister`: expects `204`.
    pub async fn unregister(&self, client_id: &str) -> Result<(), Error> {
        let url = self.client_endpoint(client_id, "unregister")?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::UnexpectedStatus {
                endpoint: "unregister",
                status: status.as_u16(),
            }),
        }
    }

    // ── Mutating calls ───────────────────────────────────────────────

    /// `POST /{client_id}/command`: expects `202 {command_id}`.
    pub async fn command(&self, client_id: &str, command: &Command) -> Result<CommandAccepted, Error> {
        let url = self.client_endpoint(client_id, "command")?;
        self.post_json("command", url, command, StatusCode::ACCEPTED)
            .await
    }

    /// `POST /{client_id}/browse`: vendor-shaped pass-through.
    pub async fn browse(&self, client_id: &str, body: &Value) -> Result<Value, Error> {
        let url = self.client_endpoint(client_id, "browse")?;
        self.post_json("browse", url, body, StatusCode::OK).await
    }

    /// `POST /{client_id}/load`: vendor-shaped pass-through.
    pub async fn load(&self, client_id: &str, body: &Value) -> Result<Value, Error> {
        let url = self.client_endpoint(client_id, "load")?;
        self.post_json("load", url, body, StatusCode::OK).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        url: Url,
        body: &impl Serialize,
        expected: StatusCode,
    ) -> Result<T, Error> {
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            return Err(Error::Forbidden { endpoint });
        }
        if status != expected {
            return Err(Error::UnexpectedStatus {
                endpoint,
                status: status.as_u16(),
            });
        }

        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text,
        })
    }

    // ── Event stream ─────────────────────────────────────────────────

    /// `GET {location}/events`: open the session's push stream.
    ///
    /// Resolves once the relay has answered; events then flow through the
    /// returned stream. Malformed events are logged and skipped so one bad
    /// message never stalls the ones behind it.
    pub async fn events(&self, location: &str) -> Result<EventStream, Error> {
        let url = self.session_url(location, "events")?;
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => return Err(Error::Forbidden { endpoint: "events" }),
            status => {
                return Err(Error::UnexpectedStatus {
                    endpoint: "events",
                    status: status.as_u16(),
                });
            }
        }

        let stream = resp
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) => match RelayEvent::parse(&event.event, &event.data) {
                        Ok(parsed) => Some(Ok(parsed)),
                        Err(e) => {
                            warn!(event = %event.event, error = %e, "dropping malformed relay event");
                            None
                        }
                    },
                    Err(e) => Some(Err(Error::EventStream(e.to_string()))),
                }
            });

        Ok(Box::pin(stream))
    }
}
