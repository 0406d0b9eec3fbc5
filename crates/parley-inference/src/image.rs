use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::error::InferenceError;
use crate::types::{FetchContext, ImageReference};

pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageFetchError {
    #[error("unsupported image content type: {0}")]
    UnsupportedContentType(String),

    #[error("image exceeds {limit} bytes (got at least {actual})")]
    TooLarge { actual: usize, limit: usize },

    #[error("no image fetch service configured")]
    ServiceUnavailable,

    #[error("image download failed: {0}")]
    Download(String),
}

impl From<ImageFetchError> for InferenceError {
    fn from(error: ImageFetchError) -> Self {
        InferenceError::conversion(format!("Image attachment rejected: {error}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl FetchedImage {
    pub fn base64(&self) -> String {
        BASE64_STANDARD.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.content_type, self.base64())
    }
}

/// Boundary to the object store that holds uploaded attachments.
#[async_trait]
pub trait ImageFetchService: Send + Sync {
    async fn fetch(
        &self,
        reference: &ImageReference,
        context: &FetchContext,
    ) -> Result<FetchedImage, ImageFetchError>;
}

pub type ImageFetchServiceRef = Arc<dyn ImageFetchService>;

pub fn validate_content_type(content_type: &str) -> Result<String, ImageFetchError> {
    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if SUPPORTED_IMAGE_TYPES.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(ImageFetchError::UnsupportedContentType(
            content_type.to_string(),
        ))
    }
}

pub fn validate_size(len: usize) -> Result<(), ImageFetchError> {
    if len > MAX_IMAGE_BYTES {
        return Err(ImageFetchError::TooLarge {
            actual: len,
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(())
}

/// Fetches and validates one image. The declared type is checked before any
/// bytes move; the size is checked again on the fetched payload.
pub(crate) async fn load_image(
    fetcher: Option<&dyn ImageFetchService>,
    reference: &ImageReference,
    context: &FetchContext,
) -> Result<FetchedImage, InferenceError> {
    validate_content_type(&reference.content_type)?;
    let fetcher = fetcher.ok_or(ImageFetchError::ServiceUnavailable)?;
    let image = fetcher.fetch(reference, context).await?;
    let content_type = validate_content_type(&image.content_type)?;
    validate_size(image.bytes.len())?;
    debug!(
        url = %reference.url,
        content_type = %content_type,
        bytes = image.bytes.len(),
        "image attachment loaded"
    );
    Ok(FetchedImage {
        bytes: image.bytes,
        content_type,
    })
}

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Downloads over plain HTTP(S), stopping as soon as the size limit is
/// crossed. The request id, when known, is forwarded as `x-request-id`.
#[derive(Clone, Default)]
pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetchService for HttpImageFetcher {
    async fn fetch(
        &self,
        reference: &ImageReference,
        context: &FetchContext,
    ) -> Result<FetchedImage, ImageFetchError> {
        let mut request = self.client.get(reference.url.as_str());
        if let Some(request_id) = &context.request_id {
            request = request.header(REQUEST_ID_HEADER, request_id);
        }
        let response = request
            .send()
            .await
            .map_err(|error| ImageFetchError::Download(error.to_string()))?;
        if !response.status().is_success() {
            return Err(ImageFetchError::Download(format!(
                "HTTP {} for {}",
                response.status().as_u16(),
                reference.url
            )));
        }
        if let Some(length) = response.content_length() {
            validate_size(length as usize)?;
        }

        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(next) = body.next().await {
            let piece = next.map_err(|error| ImageFetchError::Download(error.to_string()))?;
            bytes.extend_from_slice(&piece);
            validate_size(bytes.len())?;
        }

        Ok(FetchedImage {
            bytes,
            content_type: reference.content_type.clone(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StaticImageFetcher;
    use super::*;
    use crate::error::InferenceErrorCode;

    fn reference(url: &str, content_type: &str) -> ImageReference {
        ImageReference {
            url: url.to_string(),
            content_type: content_type.to_string(),
        }
    }

    #[test]
    fn content_type_allow_list_ignores_parameters_and_case() {
        assert_eq!(
            validate_content_type("Image/PNG; charset=binary").as_deref(),
            Ok("image/png")
        );
        assert!(matches!(
            validate_content_type("image/svg+xml"),
            Err(ImageFetchError::UnsupportedContentType(_))
        ));
    }

    #[tokio::test]
    async fn load_image_requires_fetch_service() {
        let error = load_image(None, &reference("s3://a.png", "image/png"), &FetchContext::default())
            .await
            .expect_err("missing service must fail");
        assert_eq!(error.code, InferenceErrorCode::ConversionFailed);
        assert!(error.message.contains("no image fetch service"));
    }

    #[tokio::test]
    async fn load_image_rejects_oversize_payload() {
        let fetcher = StaticImageFetcher::with_image(
            "s3://big.png",
            "image/png",
            &vec![0_u8; MAX_IMAGE_BYTES + 1],
        );
        let error = load_image(
            Some(&fetcher),
            &reference("s3://big.png", "image/png"),
            &FetchContext::default(),
        )
            .await
            .expect_err("oversize must fail");
        assert_eq!(error.code, InferenceErrorCode::ConversionFailed);
    }

    #[tokio::test]
    async fn load_image_returns_base64_ready_payload() {
        let fetcher = StaticImageFetcher::with_image("s3://a.gif", "image/gif", b"GIF89a");
        let image = load_image(
            Some(&fetcher),
            &reference("s3://a.gif", "image/gif"),
            &FetchContext::default(),
        )
            .await
            .expect("image loads");
        assert_eq!(image.base64(), "R0lGODlh");
        assert_eq!(image.data_url(), "data:image/gif;base64,R0lGODlh");
    }

    #[tokio::test]
    async fn fetch_context_reaches_the_store() {
        let fetcher = StaticImageFetcher::with_image("s3://t.png", "image/png", b"png")
            .for_tenant("acme");
        let image_ref = reference("s3://t.png", "image/png");

        let other = FetchContext {
            tenant_id: Some("globex".to_string()),
            request_id: None,
        };
        let error = load_image(Some(&fetcher), &image_ref, &other)
            .await
            .expect_err("other tenant");
        assert!(error.message.contains("not visible"));

        let owner = FetchContext {
            tenant_id: Some("acme".to_string()),
            request_id: Some("req-1".to_string()),
        };
        let image = load_image(Some(&fetcher), &image_ref, &owner)
            .await
            .expect("owner sees it");
        assert_eq!(image.bytes, b"png".to_vec());
    }
}
