//! `Accept` header based archive format selection.

use hyper::header::{HeaderMap, HeaderValue, ACCEPT};

use super::format::ArchiveFormat;

/// Outcome of the negotiation, `matched` is false if no supported format was requested
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NegotiationResult {
    pub content_type: &'static str,
    pub matched: bool,
}

impl NegotiationResult {
    fn from_format(format: ArchiveFormat) -> Self {
        Self {
            content_type: format.content_type(),
            matched: true,
        }
    }

    pub fn format(&self) -> Option<ArchiveFormat> {
        if self.matched {
            ArchiveFormat::from_content_type(self.content_type)
        } else {
            None
        }
    }
}

/// Pick the archive format from the request's `Accept` headers.
///
/// Every header line is compared as a whole. When several lines name a format, the last
/// one wins. Formats missing from `enabled` are treated like unknown content types.
pub fn negotiate(headers: &HeaderMap, enabled: &[ArchiveFormat]) -> NegotiationResult {
    negotiate_values(headers.get_all(ACCEPT).iter(), enabled)
}

pub fn negotiate_values<'a, I>(values: I, enabled: &[ArchiveFormat]) -> NegotiationResult
where
    I: IntoIterator<Item = &'a HeaderValue>,
{
    values
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| ArchiveFormat::from_content_type(value.trim()))
        .filter(|format| enabled.contains(format))
        .last()
        .map(NegotiationResult::from_format)
        .unwrap_or_default()
}
