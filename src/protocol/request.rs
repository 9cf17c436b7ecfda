//! HTTP/3 request types and builders.

use crate::error::{H3Error, H3Result, MalformedReason, ProtocolError};
use crate::protocol::headers::{FieldSection, Headers, PseudoHeaders};
use crate::protocol::Body;
use bytes::Bytes;
use http::{Method, Uri};

/// An HTTP/3 request as sent by the client.
#[derive(Debug)]
pub struct H3Request {
    /// HTTP method
    pub method: Method,

    /// Request URI
    pub uri: Uri,

    /// Request headers, in order and with their original case
    pub headers: Headers,

    /// Request body
    pub body: Option<Body>,
}

impl H3Request {
    /// Create a new request with the given method and URI.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::GET, uri)
    }

    /// Create a POST request.
    pub fn post<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::POST, uri)
    }

    /// Create a PUT request.
    pub fn put<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::PUT, uri)
    }

    /// Create a DELETE request.
    pub fn delete<T>(uri: T) -> H3RequestBuilder
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        H3RequestBuilder::new(Method::DELETE, uri)
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(|s| s.parse().ok())
    }

    /// Check if the request has a body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Get the request authority (host).
    pub fn authority(&self) -> Option<&str> {
        self.uri.authority().map(|a| a.as_str())
    }

    /// Get the request path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get the request query string.
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// The field section for the request HEADERS frame.
    ///
    /// Fails when the URI carries no authority, since `:authority` is the
    /// only way the target host reaches the server.
    pub fn to_field_section(&self) -> H3Result<FieldSection> {
        let authority = self
            .authority()
            .ok_or_else(|| H3Error::InvalidArgument(format!("URI {} has no authority", self.uri)))?;
        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        Ok(FieldSection {
            pseudo: PseudoHeaders {
                method: Some(self.method.as_str().to_string()),
                scheme: Some(self.uri.scheme_str().unwrap_or("https").to_string()),
                authority: Some(authority.to_string()),
                path: Some(path.to_string()),
                ..PseudoHeaders::default()
            },
            headers: self.headers.clone(),
        })
    }
}

/// Builder for constructing H3 requests.
#[derive(Debug)]
pub struct H3RequestBuilder {
    method: Method,
    uri: Result<Uri, http::Error>,
    headers: Headers,
    body: Option<Body>,
}

impl H3RequestBuilder {
    /// Create a new request builder.
    pub fn new<T>(method: Method, uri: T) -> Self
    where
        T: TryInto<Uri>,
        T::Error: Into<http::Error>,
    {
        Self {
            method,
            uri: uri.try_into().map_err(Into::into),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Append a header. Repeated names are kept, in order.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the request body.
    pub fn body<B>(mut self, body: B) -> Self
    where
        B: Into<Body>,
    {
        self.body = Some(body.into());
        self
    }

    /// Set the content type header.
    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        self.header("content-type", content_type)
    }

    /// Set the user agent header.
    pub fn user_agent(self, user_agent: impl Into<String>) -> Self {
        self.header("user-agent", user_agent)
    }

    /// Set the authorization header.
    pub fn authorization(self, auth: impl Into<String>) -> Self {
        self.header("authorization", auth)
    }

    /// Build the request.
    pub fn build(self) -> Result<H3Request, http::Error> {
        Ok(H3Request {
            method: self.method,
            uri: self.uri?,
            headers: self.headers,
            body: self.body,
        })
    }
}

/// A request as seen by a server-side handler.
///
/// The body and any trailers have been read in full before the handler runs.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    /// Stream the request arrived on
    pub stream_id: u64,
    pub method: Method,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    /// `:protocol` of an Extended CONNECT
    pub protocol: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
    pub trailers: Option<Headers>,
}

impl ServerRequest {
    /// Build from a validated request field section.
    pub fn from_section(stream_id: u64, section: FieldSection) -> H3Result<Self> {
        let method = section.pseudo.method.as_deref().unwrap_or_default();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ProtocolError::MalformedRequest(MalformedReason::InvalidMethod))?;
        Ok(Self {
            stream_id,
            method,
            scheme: section.pseudo.scheme,
            authority: section.pseudo.authority,
            path: section.pseudo.path,
            protocol: section.pseudo.protocol,
            headers: section.headers,
            body: Bytes::new(),
            trailers: None,
        })
    }

    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        let path = self.path.as_deref().unwrap_or("");
        path.split_once('?').map_or(path, |(p, _)| p)
    }

    /// Authority, falling back to the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.authority.as_deref().or_else(|| self.headers.get("host"))
    }

    pub fn is_extended_connect(&self) -> bool {
        self.method == Method::CONNECT && self.protocol.is_some()
    }
}
