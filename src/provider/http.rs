//! HTTP building blocks for [`RemoteProvider`](super::RemoteProvider)
//! implementations. The wire protocol of a concrete provider is its
//! own concern; range fetching is common to all of them.

use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use url::Url;

use super::{ByteStream, ProviderError};

/// Client with the per-request timeout every provider call uses.
pub fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ProviderError::from)
}

/// Issue a `Range: bytes=start-end` GET and stream the body. Maps
/// upstream statuses onto the provider error taxonomy (404/410 of a
/// previously valid URL means the link went stale).
pub async fn fetch_range(
    client: &Client,
    url: &str,
    start: u64,
    end_inclusive: u64,
) -> Result<ByteStream, ProviderError> {
    let url = Url::parse(url).map_err(|e| ProviderError::Network(e.to_string()))?;

    let response = client
        .get(url)
        .header("Range", format!("bytes={}-{}", start, end_inclusive))
        .send()
        .await?;

    if let Some(err) = ProviderError::from_status(response.status().as_u16()) {
        return Err(err);
    }

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(ProviderError::from));
    Ok(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(stream: ByteStream) -> Result<Vec<u8>, ProviderError> {
        let chunks: Vec<_> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_range_request_streams_partial_content() {
        let mut server = mockito::Server::new_async().await;
        let body: Vec<u8> = (0u8..64).collect();
        let mock = server
            .mock("GET", "/file.bin")
            .match_header("range", "bytes=16-31")
            .with_status(206)
            .with_body(&body[16..32])
            .create_async()
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let url = format!("{}/file.bin", server.url());
        let stream = fetch_range(&client, &url, 16, 31).await.unwrap();
        let data = collect(stream).await.unwrap();

        assert_eq!(&data, &body[16..32]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_gone_resource_maps_to_stale_link() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/stale.bin")
            .with_status(404)
            .create_async()
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let url = format!("{}/stale.bin", server.url());
        let err = match fetch_range(&client, &url, 0, 7).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ProviderError::Gone));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/busy.bin")
            .with_status(429)
            .create_async()
            .await;

        let client = build_client(Duration::from_secs(5)).unwrap();
        let url = format!("{}/busy.bin", server.url());
        let err = match fetch_range(&client, &url, 0, 7).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ProviderError::RateLimited));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unparseable_url_is_a_network_error() {
        let client = build_client(Duration::from_secs(5)).unwrap();
        let err = match fetch_range(&client, "not a url", 0, 7).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ProviderError::Network(_)));
    }
}
