//! HTTP implementation of [`FilenApi`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::dto::{
    endpoints, AuthInfo, AuthInfoRequest, ChunkTarget, CreateFolderRequest, DirContent,
    DoneRequest, Envelope, FileInfo, LoginData, LoginRequest, MoveRequest, PrepareRequest,
    RawAuthInfo, RawCreateFolder, RawDownload, RawFileInfo, RawLogin, RawPrepare,
    RawStorageUsage, RawUserInfo, StorageUsage, UserInfo, UuidRequest,
};
use crate::service::{ByteStream, FilenApi};
use filenvault_common::{Error, FolderRef, RemoteId, Result, SecretString};

/// Authenticated body: the endpoint payload plus `apiKey`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Authed<'a, B: Serialize> {
    api_key: &'a str,
    #[serde(flatten)]
    body: &'a B,
}

/// Empty authenticated payload.
#[derive(Serialize)]
struct NoBody {}

/// reqwest-backed service client.
pub struct HttpApi {
    http: Client,
    base: Url,
}

impl HttpApi {
    /// Create a client from configuration.
    ///
    /// The configured timeout applies to every call.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("FilenVault/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base: config.base_url()?,
        })
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        self.base
            .join(endpoint)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", endpoint, e)))
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(endpoint, "POST");
        let response = self
            .http
            .post(self.url(endpoint)?)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let bytes = read_body(endpoint, response).await?;
        decode_envelope::<T>(endpoint, &bytes)?.into_data(endpoint)
    }

    async fn post_authed<B, T>(&self, endpoint: &str, api_key: &SecretString, body: &B) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let authed = Authed {
            api_key: api_key.expose(),
            body,
        };
        self.post(endpoint, &authed).await
    }

    async fn post_authed_status<B: Serialize>(
        &self,
        endpoint: &str,
        api_key: &SecretString,
        body: &B,
    ) -> Result<()> {
        debug!(endpoint, "POST");
        let authed = Authed {
            api_key: api_key.expose(),
            body,
        };
        let response = self
            .http
            .post(self.url(endpoint)?)
            .json(&authed)
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let bytes = read_body(endpoint, response).await?;
        decode_envelope::<IgnoredAny>(endpoint, &bytes)?.into_status(endpoint)
    }
}

/// Classify a reqwest failure.
fn transport_error(endpoint: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(endpoint.to_string())
    } else {
        Error::Network(format!("{}: {}", endpoint, err))
    }
}

/// Map HTTP status, then return the body.
async fn read_body(endpoint: &str, response: reqwest::Response) -> Result<Bytes> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Auth(format!("{} rejected the API key", endpoint)));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::Network(format!("{} answered {}", endpoint, status)));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(endpoint, e))?;

    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes);
        return Err(Error::Api {
            endpoint: endpoint.to_string(),
            message: format!("{} - {}", status, body),
        });
    }
    Ok(bytes)
}

/// `status: false` from the credential endpoints means the account or
/// password was refused.
pub(crate) fn credentials_rejected(err: Error) -> Error {
    match err {
        Error::Api { endpoint, message } => Error::Auth(format!("{}: {}", endpoint, message)),
        other => other,
    }
}

/// Parse the `{status, message, data}` wrapper.
pub(crate) fn decode_envelope<T: DeserializeOwned>(endpoint: &str, bytes: &[u8]) -> Result<Envelope<T>> {
    serde_json::from_slice(bytes).map_err(|e| Error::Protocol {
        endpoint: endpoint.to_string(),
        message: format!("malformed response: {}", e),
    })
}

#[async_trait]
impl FilenApi for HttpApi {
    fn name(&self) -> &str {
        "http"
    }

    async fn auth_info(&self, email: &str) -> Result<AuthInfo> {
        let body = AuthInfoRequest {
            email: email.to_string(),
        };
        let raw: RawAuthInfo = self
            .post(endpoints::AUTH_INFO, &body)
            .await
            .map_err(credentials_rejected)?;
        raw.validate()
    }

    async fn login(&self, request: &LoginRequest) -> Result<LoginData> {
        let raw: RawLogin = self
            .post(endpoints::LOGIN, request)
            .await
            .map_err(credentials_rejected)?;
        raw.validate()
    }

    async fn user_info(&self, api_key: &SecretString) -> Result<UserInfo> {
        let raw: RawUserInfo = self
            .post_authed(endpoints::USER_INFO, api_key, &NoBody {})
            .await?;
        raw.validate()
    }

    async fn storage_usage(&self, api_key: &SecretString) -> Result<StorageUsage> {
        let raw: RawStorageUsage = self
            .post_authed(endpoints::USER_STORAGE, api_key, &NoBody {})
            .await?;
        raw.validate()
    }

    async fn upload_prepare(&self, api_key: &SecretString, request: &PrepareRequest) -> Result<String> {
        let raw: RawPrepare = self
            .post_authed(endpoints::UPLOAD_PREPARE, api_key, request)
            .await?;
        raw.validate()
    }

    async fn upload_chunk(&self, target: &ChunkTarget, data: Bytes) -> Result<()> {
        let endpoint = endpoints::UPLOAD;
        debug!(endpoint, chunk = target.index, size = data.len(), "POST chunk");

        let response = self
            .http
            .post(self.url(endpoint)?)
            .query(target)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let bytes = read_body(endpoint, response).await?;
        decode_envelope::<IgnoredAny>(endpoint, &bytes)?.into_status(endpoint)
    }

    async fn upload_done(&self, api_key: &SecretString, request: &DoneRequest) -> Result<()> {
        self.post_authed_status(endpoints::UPLOAD_DONE, api_key, request)
            .await
    }

    async fn file_info(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<FileInfo> {
        let body = UuidRequest {
            uuid: uuid.to_string(),
        };
        let raw: RawFileInfo = self.post_authed(endpoints::FILE_INFO, api_key, &body).await?;
        raw.validate()
    }

    async fn download_url(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<String> {
        let body = UuidRequest {
            uuid: uuid.to_string(),
        };
        let raw: RawDownload = self
            .post_authed(endpoints::DOWNLOAD_FILE, api_key, &body)
            .await?;
        raw.validate()
    }

    async fn fetch_blob(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("download", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Download failed: {} - {}", status, body);
            return Err(if status.is_server_error() {
                Error::Network(message)
            } else {
                Error::NotFound(message)
            });
        }

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| transport_error("download", e)));

        Ok(Box::pin(stream))
    }

    async fn dir_content(&self, api_key: &SecretString, folder: &FolderRef) -> Result<DirContent> {
        let body = UuidRequest {
            uuid: folder.as_wire().to_string(),
        };
        self.post_authed(endpoints::DIR_CONTENT, api_key, &body).await
    }

    async fn create_folder(
        &self,
        api_key: &SecretString,
        request: &CreateFolderRequest,
    ) -> Result<RemoteId> {
        let raw: RawCreateFolder = self
            .post_authed(endpoints::DIR_CREATE, api_key, request)
            .await?;
        raw.validate()
    }

    async fn move_file(&self, api_key: &SecretString, request: &MoveRequest) -> Result<()> {
        self.post_authed_status(endpoints::FILE_MOVE, api_key, request)
            .await
    }

    async fn trash_file(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<()> {
        let body = UuidRequest {
            uuid: uuid.to_string(),
        };
        self.post_authed_status(endpoints::FILE_TRASH, api_key, &body)
            .await
    }

    async fn move_folder(&self, api_key: &SecretString, request: &MoveRequest) -> Result<()> {
        self.post_authed_status(endpoints::DIR_MOVE, api_key, request)
            .await
    }

    async fn trash_folder(&self, api_key: &SecretString, uuid: &RemoteId) -> Result<()> {
        let body = UuidRequest {
            uuid: uuid.to_string(),
        };
        self.post_authed_status(endpoints::DIR_TRASH, api_key, &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::RawLogin;

    #[test]
    fn test_endpoint_urls() {
        let config = ClientConfig {
            api_base: "https://gateway.example.test".to_string(),
            ..Default::default()
        };
        let api = HttpApi::new(&config).unwrap();

        assert_eq!(
            api.url(endpoints::UPLOAD_PREPARE).unwrap().as_str(),
            "https://gateway.example.test/v3/upload/prepare"
        );
        assert_eq!(api.name(), "http");
    }

    #[test]
    fn test_authed_body_flattens_payload() {
        let body = UuidRequest {
            uuid: "f1".to_string(),
        };
        let authed = Authed {
            api_key: "secret",
            body: &body,
        };
        let json = serde_json::to_value(&authed).unwrap();
        assert_eq!(json, serde_json::json!({"apiKey": "secret", "uuid": "f1"}));
    }

    #[test]
    fn test_decode_envelope_malformed_is_protocol_error() {
        let result = decode_envelope::<RawLogin>(endpoints::LOGIN, b"<html>");
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_rejected_login_is_auth_error() {
        let envelope = decode_envelope::<RawLogin>(
            endpoints::LOGIN,
            br#"{"status":false,"message":"Invalid credentials"}"#,
        )
        .unwrap();
        let result = envelope.into_data(endpoints::LOGIN).map_err(credentials_rejected);
        match result {
            Err(Error::Auth(message)) => assert!(message.contains("Invalid credentials")),
            other => panic!("expected Auth, got {:?}", other.map(|_| ())),
        }

        // Transport failures keep their class.
        let network = credentials_rejected(Error::Network("reset".to_string()));
        assert!(network.is_transient());
    }

    #[test]
    fn test_decode_envelope_unit_status() {
        let ok = decode_envelope::<IgnoredAny>(endpoints::UPLOAD, br#"{"status":true,"data":{"bucket":"x"}}"#)
            .unwrap();
        assert!(ok.into_status(endpoints::UPLOAD).is_ok());

        let rejected =
            decode_envelope::<IgnoredAny>(endpoints::UPLOAD, br#"{"status":false,"message":"bad chunk"}"#)
                .unwrap();
        assert!(matches!(
            rejected.into_status(endpoints::UPLOAD),
            Err(Error::Api { .. })
        ));
    }
}
