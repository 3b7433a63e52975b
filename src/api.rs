//! The HTTP shape of the settings write endpoint.
//!
//! This crate doesn't ship an HTTP client. Instead, [`SettingsApi`] builds
//! the request (path, headers, JSON body), hands it to an [`HttpTransport`],
//! and interprets the response. Anything that can send a request and return
//! a status and a body can be plugged in.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    batch::RequestBatcher,
    changes::ChangeSet,
    config::ClientConfig,
    error::{Error, NetworkWriteError, Result},
    setting::SettingsResponse,
};

/// Path of the settings write endpoint, relative to the base path
pub const SETTINGS_PATH: &str = "/api/kibana/settings";

/// Header carrying the client's version, so that a server running a
/// different build can refuse the request instead of misreading it
pub const VERSION_HEADER: &str = "kbn-version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Sends a single HTTP request. Implemented for any
/// `Fn(HttpRequest) -> impl Future<Output = Result<HttpResponse, NetworkWriteError>>`.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, std::result::Result<HttpResponse, NetworkWriteError>>;
}

impl<F, Fut> HttpTransport for F
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<HttpResponse, NetworkWriteError>> + Send + 'static,
{
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, std::result::Result<HttpResponse, NetworkWriteError>> {
        self(request).boxed()
    }
}

/// The future returned by [`SettingsApi::write`]
pub type WriteFuture = BoxFuture<'static, Result<SettingsResponse>>;

/// The dispatch function of a batcher created by [`SettingsApi::into_batcher`]
pub type WriteDispatch = Box<dyn Fn(ChangeSet) -> WriteFuture + Send + Sync>;

/// A [`RequestBatcher`] that writes through a [`SettingsApi`]
pub type ApiBatcher = RequestBatcher<SettingsResponse, Error, WriteFuture, WriteDispatch>;

#[derive(Serialize)]
struct WriteBody<'a> {
    changes: &'a ChangeSet,
}

async fn send_write<T: HttpTransport>(
    transport: Arc<T>,
    request: HttpRequest,
    keys: usize,
) -> Result<SettingsResponse> {
    debug!(url = %request.url, keys, "sending settings write");

    let response = transport.send(request).await?;
    if response.status >= 300 {
        warn!(status = response.status, "settings write rejected");
        return Err(NetworkWriteError::Status(response.status).into());
    }

    serde_json::from_str(&response.body)
        .map_err(|err| NetworkWriteError::Decode(Arc::new(err)).into())
}

/// Client for the settings write endpoint.
pub struct SettingsApi<T> {
    transport: Arc<T>,
    base_path: String,
    version: String,
}

impl<T> Clone for SettingsApi<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            base_path: self.base_path.clone(),
            version: self.version.clone(),
        }
    }
}

impl<T> fmt::Debug for SettingsApi<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsApi")
            .field("base_path", &self.base_path)
            .field("version", &self.version)
            .finish()
    }
}

impl<T: HttpTransport> SettingsApi<T> {
    pub fn new(transport: T, config: &ClientConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            base_path: config.base_path.trim_end_matches('/').to_owned(),
            version: config.server_version.clone(),
        }
    }

    /// Build the request that writes `changes`.
    pub fn request(&self, changes: &ChangeSet) -> Result<HttpRequest> {
        let body = serde_json::to_string(&WriteBody { changes })?;

        Ok(HttpRequest {
            method: "POST",
            url: format!("{}{}", self.base_path, SETTINGS_PATH),
            headers: vec![
                ("accept", "application/json".to_owned()),
                ("content-type", "application/json".to_owned()),
                (VERSION_HEADER, self.version.clone()),
            ],
            body,
        })
    }

    /// Send `changes` to the server and decode the resulting settings
    /// snapshot. Any status of 300 or above is a failure.
    pub fn write(&self, changes: ChangeSet) -> WriteFuture {
        match self.request(&changes) {
            Ok(request) => send_write(self.transport.clone(), request, changes.len()).boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    /// Wrap this API in a [`RequestBatcher`], so that writes are coalesced and
    /// serialized.
    pub fn into_batcher(self, window: Duration) -> ApiBatcher {
        let dispatch: WriteDispatch = Box::new(move |changes| self.write(changes));
        RequestBatcher::new(window, dispatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor;
    use serde_json::json;

    fn respond(
        status: u16,
        body: &'static str,
    ) -> impl Fn(HttpRequest) -> future::Ready<std::result::Result<HttpResponse, NetworkWriteError>>
    {
        move |_request| {
            future::ready(Ok(HttpResponse {
                status,
                body: body.to_owned(),
            }))
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            base_path: "/base/".into(),
            server_version: "7.0.0".into(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn builds_the_write_request() {
        let api = SettingsApi::new(respond(200, "{}"), &config());
        let changes = vec![("a", json!(1)), ("b", json!(null))].into_iter().collect();
        let request = api.request(&changes).unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/base/api/kibana/settings");
        assert_eq!(request.header("kbn-version"), Some("7.0.0"));
        assert_eq!(request.header("Content-Type"), Some("application/json"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&request.body).unwrap(),
            json!({"changes": {"a": 1, "b": null}})
        );
    }

    #[test]
    fn decodes_the_snapshot() {
        let api = SettingsApi::new(
            respond(200, r#"{"settings": {"a": {"userValue": 1}}}"#),
            &config(),
        );
        let response = executor::block_on(api.write(ChangeSet::new())).unwrap();
        assert_eq!(response.settings["a"].user_value, Some(json!(1)));
    }

    #[test]
    fn redirects_are_failures() {
        let api = SettingsApi::new(respond(302, ""), &config());
        let err = executor::block_on(api.write(ChangeSet::new())).unwrap_err();
        assert_eq!(err.to_string(), "Request failed with status code: 302");
    }

    #[test]
    fn undecodable_bodies_are_failures() {
        let api = SettingsApi::new(respond(200, "<html>"), &config());
        match executor::block_on(api.write(ChangeSet::new())) {
            Err(Error::NetworkWrite(NetworkWriteError::Decode(..))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn transport_failures_pass_through() {
        let api = SettingsApi::new(
            |_request: HttpRequest| {
                future::ready(Err::<HttpResponse, _>(NetworkWriteError::Transport(
                    "connection reset".into(),
                )))
            },
            &config(),
        );
        let err = executor::block_on(api.write(ChangeSet::new())).unwrap_err();
        assert!(err.is_network());
        assert_eq!(err.to_string(), "Transport error: connection reset");
    }
}
