//! Outbound request construction.

use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::{HeaderMap, Method};
use url::Url;

use crate::error::{TileError, TransportError};
use crate::tile::{TileKey, TileRequest};

/// Format substituted for `{format}` when the request carries no hint.
pub const DEFAULT_TILE_FORMAT: &str = "png";

/// Transport-agnostic description of one tile fetch.
#[derive(Debug, Clone)]
pub struct TileHttpRequest {
    /// HTTP method (always GET for tiles today)
    pub method: Method,

    /// Absolute target URL
    pub url: Url,

    /// Extra request headers
    pub headers: HeaderMap,
}

impl TileHttpRequest {
    /// Create a GET request with no extra headers.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// URL scheme, e.g. `http`.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Whether the request carries credentials, either as an
    /// `Authorization` header or as userinfo in the URL.
    pub fn has_credentials(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
            || !self.url.username().is_empty()
            || self.url.password().is_some()
    }
}

/// Builds the outbound request for a tile.
pub trait RequestBuilder: Send + Sync {
    /// Build the request for `request`.
    ///
    /// Hints are passed through unmodified.
    fn build(&self, request: &TileRequest) -> Result<TileHttpRequest, TileError>;
}

// =============================================================================
// URL Template Builder
// =============================================================================

/// Request builder that expands a URL template.
///
/// Recognised placeholders:
///
/// | Placeholder | Value |
/// |---|---|
/// | `{pyramid}` | pyramid id (url-encoded) |
/// | `{mosaic}` | mosaic id (url-encoded) |
/// | `{col}` / `{row}` | tile column / row |
/// | `{format}` | `format` hint, or [`DEFAULT_TILE_FORMAT`] |
/// | `{<hint>}` | any other hint value (url-encoded) |
///
/// # Example
///
/// ```
/// use tile_prefetch::io::{RequestBuilder, UrlTemplateBuilder};
/// use tile_prefetch::tile::{TileKey, TileRequest};
///
/// let builder =
///     UrlTemplateBuilder::new("http://tiles.local/{pyramid}/{mosaic}/{row}/{col}.{format}")
///         .unwrap();
/// let request = builder
///     .build(&TileRequest::new(TileKey::new("osm", "z3", 4, 2)))
///     .unwrap();
/// assert_eq!(request.url.as_str(), "http://tiles.local/osm/z3/2/4.png");
/// ```
#[derive(Debug, Clone)]
pub struct UrlTemplateBuilder {
    template: String,
    headers: HeaderMap,
}

impl UrlTemplateBuilder {
    /// Create a builder, checking that the template expands to a valid URL.
    pub fn new(template: impl Into<String>) -> Result<Self, TransportError> {
        let template = template.into();
        let builder = Self {
            template,
            headers: HeaderMap::new(),
        };

        let probe = builder.expand(&TileRequest::new(TileKey::new("p", "m", 0, 0)));
        let url = Url::parse(&probe)
            .map_err(|e| TransportError::InvalidTemplate(format!("{}: {}", builder.template, e)))?;
        if url.host_str().is_none() {
            return Err(TransportError::InvalidTemplate(format!(
                "{}: no host",
                builder.template
            )));
        }

        Ok(builder)
    }

    /// Attach a header to every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| TransportError::InvalidHeader {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Authenticate every request with a bearer token.
    pub fn with_bearer_token(self, token: &str) -> Result<Self, TransportError> {
        self.with_header(AUTHORIZATION.as_str(), &format!("Bearer {}", token))
    }

    /// The raw template.
    pub fn template(&self) -> &str {
        &self.template
    }

    fn expand(&self, request: &TileRequest) -> String {
        let key = &request.key;
        let format = request.format().unwrap_or(DEFAULT_TILE_FORMAT);

        let mut url = self
            .template
            .replace("{pyramid}", &urlencoding::encode(&key.pyramid_id))
            .replace("{mosaic}", &urlencoding::encode(&key.mosaic_id))
            .replace("{col}", &key.col.to_string())
            .replace("{row}", &key.row.to_string())
            .replace("{format}", &urlencoding::encode(format));

        for (name, value) in &request.hints {
            let placeholder = format!("{{{}}}", name);
            if url.contains(&placeholder) {
                url = url.replace(&placeholder, &urlencoding::encode(value));
            }
        }

        url
    }
}

impl RequestBuilder for UrlTemplateBuilder {
    fn build(&self, request: &TileRequest) -> Result<TileHttpRequest, TileError> {
        let key = &request.key;
        let expanded = self.expand(request);
        let url = Url::parse(&expanded)
            .map_err(|e| TileError::InvalidRequest(format!("{} for tile {}: {}", expanded, key, e)))?;

        Ok(TileHttpRequest {
            method: Method::GET,
            url,
            headers: self.headers.clone(),
        })
    }
}
