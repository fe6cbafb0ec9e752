use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use url::Url;

use crate::address::ObjectAddress;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch transport error: {0}")]
    Transport(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// An inclusive range of media objects on one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub track: String,
    pub start: ObjectAddress,
    pub end: ObjectAddress,
}

impl FetchRequest {
    pub fn new(track: impl Into<String>, start: ObjectAddress, end: ObjectAddress) -> Self {
        debug_assert!(start <= end, "fetch range must not be inverted");
        Self {
            track: track.into(),
            start,
            end,
        }
    }

    /// Every object of a single media group.
    pub fn for_group(track: impl Into<String>, group: u64, objects_per_group: u64) -> Self {
        Self::new(
            track,
            ObjectAddress::new(group, 0),
            ObjectAddress::new(group, objects_per_group.saturating_sub(1)),
        )
    }

    /// The reserved initialization segment at group 0.
    pub fn init_segment(track: impl Into<String>) -> Self {
        Self::new(track, ObjectAddress::INIT_SEGMENT, ObjectAddress::INIT_SEGMENT)
    }
}

/// One fetched media object, addressed and ready to append.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub address: ObjectAddress,
    pub payload: Bytes,
}

/// Objects arrive in address order; consumers append them as they come.
pub type ObjectStream = BoxStream<'static, Result<FetchedObject, FetchError>>;

/// Source of media bytes, keyed by track and object range.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<ObjectStream, FetchError>;
}

/// Fetches ranges over HTTP from a relay exposing a `/range` endpoint.
///
/// The relay replies with one concatenated body (initialization segment plus
/// every fragment in range), so the whole response surfaces as a single
/// stream item addressed at the range start.
pub struct HttpFetchTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetchTransport {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl FetchTransport for HttpFetchTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<ObjectStream, FetchError> {
        let url = range_url(&self.base_url, &request)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?
            .error_for_status()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let payload = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let object = FetchedObject {
            address: request.start,
            payload,
        };
        Ok(stream::iter([Ok(object)]).boxed())
    }
}

fn range_url(base: &Url, request: &FetchRequest) -> Result<Url, FetchError> {
    let mut url = base
        .join("range")
        .map_err(|err| FetchError::Transport(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("track", &request.track)
        .append_pair("StartGroupId", &request.start.group.to_string())
        .append_pair("StartObjectId", &request.start.object.to_string())
        .append_pair("EndGroupId", &request.end.group.to_string())
        .append_pair("EndObjectId", &request.end.object.to_string());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_requests_cover_every_object() {
        let request = FetchRequest::for_group("bbb/video", 5, 48);
        assert_eq!(request.start, ObjectAddress::new(5, 0));
        assert_eq!(request.end, ObjectAddress::new(5, 47));
    }

    #[test]
    fn init_segment_requests_stay_at_group_zero() {
        let request = FetchRequest::init_segment("bbb/video");
        assert_eq!(request.start, ObjectAddress::INIT_SEGMENT);
        assert_eq!(request.end, ObjectAddress::INIT_SEGMENT);
    }

    #[test]
    fn range_urls_use_the_relay_query_names() {
        let base = Url::parse("http://localhost:8080/").unwrap();
        let request = FetchRequest::for_group("bbb/video", 5, 48);
        let url = range_url(&base, &request).unwrap();
        assert_eq!(url.path(), "/range");
        assert_eq!(
            url.query(),
            Some("track=bbb%2Fvideo&StartGroupId=5&StartObjectId=0&EndGroupId=5&EndObjectId=47")
        );
    }

    #[test]
    fn addresses_order_group_major() {
        assert!(ObjectAddress::new(1, 47) < ObjectAddress::new(2, 0));
        assert!(ObjectAddress::new(3, 2) < ObjectAddress::new(3, 10));
    }
}
