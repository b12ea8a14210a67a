use anyhow::{bail, Error};
use hyper::header;

/// Possible Compression Methods, order determines preference (later is preferred)
#[derive(Eq, Ord, PartialEq, PartialOrd, Debug)]
pub enum CompressionMethod {
    Deflate,
}

impl CompressionMethod {
    pub fn content_encoding(&self) -> header::HeaderValue {
        header::HeaderValue::from_static(self.extension())
    }

    pub fn extension(&self) -> &'static str {
        match *self {
            CompressionMethod::Deflate => "deflate",
        }
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deflate" => Ok(CompressionMethod::Deflate),
            // http accept-encoding allows to give weights with ';q='
            other if other.starts_with("deflate;q=") => Ok(CompressionMethod::Deflate),
            _ => bail!("unknown compression format"),
        }
    }
}

/// First supported method of the `Accept-Encoding` header
pub fn extract_compression_method(headers: &http::HeaderMap) -> Option<CompressionMethod> {
    if let Some(Ok(encodings)) = headers.get(header::ACCEPT_ENCODING).map(|v| v.to_str()) {
        for encoding in encodings.split(&[',', ' '][..]) {
            if let Ok(method) = encoding.parse() {
                return Some(method);
            }
        }
    }
    None
}
