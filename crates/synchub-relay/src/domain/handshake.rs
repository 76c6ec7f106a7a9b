//! Parsing of the WebSocket upgrade request line.
//!
//! Devices connect to `{prefix}/{client_id}?token=<jwt>`.  The client id is
//! chosen by the device (for example `web_1712345678` or `android_pixel7`) and
//! names one logical endpoint of the user; it is not a credential.
//!
//! Both the client id and the token arrive percent-encoded; they are decoded
//! here so the registry, the `from_client` stamp and HTTP producers all see
//! the same id.

use percent_encoding::percent_decode_str;
use synchub_core::DeviceId;
use thiserror::Error;

/// Why an upgrade request was refused before the WebSocket handshake.
///
/// Every variant is answered with HTTP 404.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("no relay endpoint at {0}")]
    UnknownPath(String),

    #[error("client id is empty")]
    EmptyClientId,

    #[error("client id is not valid UTF-8 once decoded: {0}")]
    InvalidClientId(String),
}

/// What the device asked for in its upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub device: DeviceId,
    pub token: Option<String>,
}

impl ConnectRequest {
    /// Parses the request path and query string against `prefix`.
    ///
    /// The client id is the single path segment after the prefix, percent
    /// decoded.  Only the `token` query parameter is read, form decoded;
    /// others are ignored.  An empty `token=` counts as absent.
    pub fn parse(path: &str, query: Option<&str>, prefix: &str) -> Result<Self, HandshakeError> {
        let prefix = prefix.trim_end_matches('/');
        let client_id = path
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| HandshakeError::UnknownPath(path.to_string()))?;

        if client_id.contains('/') {
            return Err(HandshakeError::UnknownPath(path.to_string()));
        }
        if client_id.is_empty() {
            return Err(HandshakeError::EmptyClientId);
        }
        let client_id = percent_decode_str(client_id)
            .decode_utf8()
            .map_err(|_| HandshakeError::InvalidClientId(client_id.to_string()))?;

        let token = query
            .unwrap_or_default()
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| form_decode(value))
            .filter(|value| !value.is_empty());

        Ok(Self {
            device: DeviceId::new(client_id.into_owned()),
            token,
        })
    }
}

/// Decodes one `application/x-www-form-urlencoded` value.
fn form_decode(value: &str) -> String {
    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_client_id_and_token() {
        // Arrange / Act
        let req = ConnectRequest::parse("/ws/web_A", Some("token=abc.def.ghi"), "/ws").unwrap();

        // Assert
        assert_eq!(req.device, DeviceId::new("web_A"));
        assert_eq!(req.token.as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_missing_query_yields_no_token() {
        let req = ConnectRequest::parse("/ws/android_B", None, "/ws").unwrap();
        assert_eq!(req.token, None);
    }

    #[test]
    fn test_empty_token_counts_as_absent() {
        let req = ConnectRequest::parse("/ws/web_A", Some("token="), "/ws").unwrap();
        assert_eq!(req.token, None);
    }

    #[test]
    fn test_token_found_among_other_parameters() {
        let req = ConnectRequest::parse("/ws/web_A", Some("v=2&token=t0k&x"), "/ws").unwrap();
        assert_eq!(req.token.as_deref(), Some("t0k"));
    }

    #[test]
    fn test_prefix_with_trailing_slash_is_accepted() {
        let req = ConnectRequest::parse("/api/ws/web_A", None, "/api/ws/").unwrap();
        assert_eq!(req.device.as_str(), "web_A");
    }

    #[test]
    fn test_wrong_prefix_is_unknown_path() {
        let result = ConnectRequest::parse("/socket/web_A", None, "/ws");
        assert!(matches!(result, Err(HandshakeError::UnknownPath(_))));
    }

    #[test]
    fn test_prefix_must_end_at_segment_boundary() {
        let result = ConnectRequest::parse("/wsx/web_A", None, "/ws");
        assert!(matches!(result, Err(HandshakeError::UnknownPath(_))));
    }

    #[test]
    fn test_empty_client_id_is_rejected() {
        assert_eq!(
            ConnectRequest::parse("/ws/", None, "/ws"),
            Err(HandshakeError::EmptyClientId)
        );
    }

    #[test]
    fn test_encoded_client_id_is_decoded() {
        // Arrange / Act
        let req = ConnectRequest::parse("/ws/web%20A", Some("token=abc"), "/ws").unwrap();

        // Assert
        assert_eq!(req.device, DeviceId::new("web A"));
        assert_eq!(req.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_encoded_token_is_decoded() {
        let req = ConnectRequest::parse("/ws/web_A", Some("token=a%2Eb+c"), "/ws").unwrap();
        assert_eq!(req.token.as_deref(), Some("a.b c"));
    }

    #[test]
    fn test_client_id_with_invalid_utf8_is_rejected() {
        let result = ConnectRequest::parse("/ws/web%FF", None, "/ws");
        assert!(matches!(result, Err(HandshakeError::InvalidClientId(_))));
    }

    #[test]
    fn test_nested_path_is_unknown() {
        let result = ConnectRequest::parse("/ws/web_A/extra", None, "/ws");
        assert!(matches!(result, Err(HandshakeError::UnknownPath(_))));
    }
}
