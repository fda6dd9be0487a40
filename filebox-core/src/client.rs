use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FileboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("unexpected response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Uniform outcome of a backend call: `{success, status, data, error}`.
///
/// Transport failures never produce an `ApiResponse`; they surface as
/// [`FileboxError::Request`] instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T = Value> {
    pub success: bool,
    pub status: u16,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl ApiResponse<Value> {
    async fn from_response(response: reqwest::Response) -> Result<Self, FileboxError> {
        let status = response.status();
        let body = response.text().await?;
        Ok(Self::from_parts(status, &body))
    }

    fn from_parts(status: StatusCode, body: &str) -> Self {
        let parsed = if body.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Value>(body).ok()
        };

        if !status.is_success() {
            let error = parsed
                .as_ref()
                .and_then(|value| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(body.trim().to_string()).filter(|text| !text.is_empty()))
                .or_else(|| status.canonical_reason().map(str::to_string));
            return Self {
                success: false,
                status: status.as_u16(),
                data: None,
                error,
            };
        }

        match parsed {
            Some(Value::Object(mut map)) if map.contains_key("success") || map.contains_key("data") => {
                let success = map
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let error = map
                    .remove("error")
                    .and_then(|value| value.as_str().map(str::to_string));
                Self {
                    success,
                    status: status.as_u16(),
                    data: map.remove("data"),
                    error: if success { None } else { error.or_else(|| Some("request rejected".into())) },
                }
            }
            Some(other) => Self {
                success: true,
                status: status.as_u16(),
                data: Some(other),
                error: None,
            },
            None => Self {
                success: true,
                status: status.as_u16(),
                data: None,
                error: None,
            },
        }
    }

    /// Converts a failed response into an error, or decodes `data` into `T`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, FileboxError> {
        if !self.success {
            return Err(self.into_error());
        }
        Ok(serde_json::from_value(self.data.unwrap_or(Value::Null))?)
    }

    pub fn into_error(self) -> FileboxError {
        FileboxError::Api {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            message: self.error.unwrap_or_else(|| "request rejected".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct FileboxClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl FileboxClient {
    pub fn new(base_url: &str) -> Result<Self, FileboxError> {
        Self::with_http(Client::new(), base_url, None)
    }

    pub fn with_token(base_url: &str, token: impl Into<String>) -> Result<Self, FileboxError> {
        Self::with_http(Client::new(), base_url, Some(token.into()))
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        token: Option<String>,
    ) -> Result<Self, FileboxError> {
        Ok(Self::from_url(http, Url::parse(base_url)?, token))
    }

    pub fn from_url(http: Client, base_url: Url, token: Option<String>) -> Self {
        Self {
            http,
            base_url,
            token: token.filter(|token| !token.is_empty()),
        }
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        let token = token.into();
        self.token = if token.is_empty() { None } else { Some(token) };
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Streams `body` as the multipart `file` field into `curdir`.
    pub async fn upload(
        &self,
        curdir: &str,
        file_name: &str,
        body: reqwest::Body,
        length: u64,
    ) -> Result<Value, FileboxError> {
        let mut url = self.endpoint("/api/file/upload")?;
        if !curdir.is_empty() {
            url.query_pairs_mut().append_pair("curdir", curdir);
        }
        let part = Part::stream_with_length(body, length)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("file", part);
        let response = self.execute(self.http.post(url).multipart(form)).await?;
        response.into_data()
    }

    /// Starts a download; the returned response body has not been read yet.
    pub async fn download(&self, relpath: &str) -> Result<reqwest::Response, FileboxError> {
        let mut url = self.endpoint("/api/file/download")?;
        url.query_pairs_mut().append_pair("relpath", relpath);
        let response = self.authorize(self.http.get(url)).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(ApiResponse::from_response(response).await?.into_error())
    }

    pub async fn list_usb_devices(&self) -> Result<Vec<UsbDevice>, FileboxError> {
        let url = self.endpoint("/api/usb/list")?;
        self.execute(self.http.get(url)).await?.into_data()
    }

    pub async fn list_files(&self, currentdir: &str) -> Result<ApiResponse, FileboxError> {
        let mut url = self.endpoint("/api/file/files")?;
        if !currentdir.is_empty() {
            url.query_pairs_mut().append_pair("currentdir", currentdir);
        }
        self.execute(self.http.get(url)).await
    }

    pub async fn copy_files(
        &self,
        files: &[String],
        todir: &str,
        action: CopyAction,
    ) -> Result<ApiResponse, FileboxError> {
        let url = self.endpoint("/file/copy")?;
        let request = CopyRequest {
            action,
            todir,
            files,
        };
        self.execute(self.http.post(url).json(&request)).await
    }

    pub async fn delete_files(&self, files: &[String]) -> Result<ApiResponse, FileboxError> {
        let url = self.endpoint("/api/file/delete")?;
        self.execute(self.http.post(url).json(&DeleteRequest { files }))
            .await
    }

    async fn execute(&self, request: RequestBuilder) -> Result<ApiResponse, FileboxError> {
        let response = self.authorize(request).send().await?;
        ApiResponse::from_response(response).await
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, FileboxError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path}"))?)
    }
}

impl FileboxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            FileboxError::Api { status, .. } => Some(classify_api_status(*status)),
            FileboxError::Request(err) => err.status().map(classify_api_status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.classification() == Some(ApiErrorClass::Auth)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// A mounted storage device as reported by the snapshot endpoint.
///
/// The endpoint may report either bare identifiers or `{device, label}`
/// objects; both decode into this type.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(from = "RawUsbDevice")]
pub struct UsbDevice {
    pub device: String,
    pub label: Option<String>,
}

impl UsbDevice {
    pub fn display_label(&self) -> &str {
        self.label
            .as_deref()
            .filter(|label| !label.trim().is_empty())
            .unwrap_or(&self.device)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUsbDevice {
    Plain(String),
    Described {
        device: String,
        #[serde(default)]
        label: Option<String>,
    },
}

impl From<RawUsbDevice> for UsbDevice {
    fn from(raw: RawUsbDevice) -> Self {
        match raw {
            RawUsbDevice::Plain(device) => Self {
                device,
                label: None,
            },
            RawUsbDevice::Described { device, label } => Self { device, label },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyAction {
    Copy,
    Move,
}

#[derive(Serialize)]
struct CopyRequest<'a> {
    action: CopyAction,
    todir: &'a str,
    files: &'a [String],
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    files: &'a [String],
}
