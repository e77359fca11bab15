use std::net::IpAddr;

use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a service base URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Plain http to a non-loopback host.
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    Insecure,
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validate the base URL of the news API.
///
/// The API key travels in a request header, so plain http is refused unless
/// the host is loopback (mock servers in tests).
///
/// ```
/// use newsdesk::util::validate_base_url;
///
/// assert!(validate_base_url("https://newsapi.org/v2").is_ok());
/// assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
/// assert!(validate_base_url("http://newsapi.org/v2").is_err());
/// assert!(validate_base_url("ftp://newsapi.org").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;
    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;

    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(host) => Ok(url),
        "http" => Err(UrlValidationError::Insecure),
        scheme => Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }
}

fn is_loopback(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_accepted() {
        let url = validate_base_url("https://newsapi.org/v2").unwrap();
        assert_eq!(url.host_str(), Some("newsapi.org"));
    }

    #[test]
    fn test_http_loopback_accepted() {
        assert!(validate_base_url("http://localhost:9000").is_ok());
        assert!(validate_base_url("http://127.0.0.1:9000").is_ok());
        assert!(validate_base_url("http://[::1]:9000").is_ok());
    }

    #[test]
    fn test_http_public_rejected() {
        assert!(matches!(
            validate_base_url("http://newsapi.org/v2"),
            Err(UrlValidationError::Insecure)
        ));
    }

    #[test]
    fn test_other_schemes_rejected() {
        assert!(matches!(
            validate_base_url("file:///etc/passwd"),
            Err(UrlValidationError::MissingHost) | Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            validate_base_url("ftp://newsapi.org"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            validate_base_url("not a url"),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }
}
