use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

/// SDK runtime source prepended to every service source at bundle time.
pub const SDK_PRELUDE: &str = include_str!("../sandbox/sdk_prelude.rhai");

const DATA_URL_PREFIX: &str = "data:application/x-rhai;base64,";

#[derive(thiserror::Error, Debug)]
pub enum BundleError {
    #[error("not a service bundle data url")]
    BadScheme,

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("bundle is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Concatenate the SDK prelude with a service source into one self-contained
/// module text. Returns `(bundle_hash, bundle_text)`.
pub fn bundle_source(service_source: &str) -> (String, String) {
    let text = format!("{SDK_PRELUDE}\n{service_source}");
    let hash = content_hash(&text);
    (hash, text)
}

pub fn encode_data_url(bundle_text: &str) -> String {
    format!("{DATA_URL_PREFIX}{}", BASE64.encode(bundle_text.as_bytes()))
}

pub fn decode_data_url(data_url: &str) -> Result<String, BundleError> {
    let b64 = data_url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or(BundleError::BadScheme)?;
    Ok(String::from_utf8(BASE64.decode(b64)?)?)
}
