use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Method,
};
use shared::domain::HttpMethod;
use tracing::debug;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
}

impl FormPart {
    pub fn name(&self) -> &str {
        match self {
            FormPart::Text { name, .. } | FormPart::File { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    Multipart(Vec<FormPart>),
}

impl RequestBody {
    /// Text value of the first field named `name`, in either encoding.
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            RequestBody::Empty => None,
            RequestBody::Form(pairs) => pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            RequestBody::Multipart(parts) => parts.iter().find_map(|part| match part {
                FormPart::Text { name: key, value } if key == name => Some(value.as_str()),
                _ => None,
            }),
        }
    }

    pub fn push_text(&mut self, name: &str, value: &str) {
        match self {
            RequestBody::Empty => *self = RequestBody::Form(vec![(name.into(), value.into())]),
            RequestBody::Form(pairs) => pairs.push((name.into(), value.into())),
            RequestBody::Multipart(parts) => parts.push(FormPart::Text {
                name: name.into(),
                value: value.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

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
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct MissingTransport;

#[async_trait]
impl HttpTransport for MissingTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Err(TransportError::Unavailable)
    }
}

/// Production transport. Non-2xx statuses are returned as responses, since
/// failure envelopes may ride on them.
pub struct ReqwestTransport {
    http: Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_timeout(timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build http client")?;
        Ok(Self { http })
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn multipart(parts: Vec<FormPart>) -> Result<Form, TransportError> {
        let mut form = Form::new();
        for part in parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name, value),
                FormPart::File {
                    name,
                    filename,
                    mime_type,
                    bytes,
                } => {
                    let mut file = Part::bytes(bytes).file_name(filename);
                    if let Some(mime) = mime_type {
                        file = file
                            .mime_str(&mime)
                            .map_err(|err| TransportError::Request(err.to_string()))?;
                    }
                    form.part(name, file)
                }
            };
        }
        Ok(form)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!(
            "transport: sending method={} url={}",
            request.method.as_str(),
            request.url
        );
        let mut builder = self
            .http
            .request(Self::method(request.method), &request.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header("X-Requested-With", "XMLHttpRequest");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Multipart(parts) => builder.multipart(Self::multipart(parts)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Body(err.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
