//! Connection descriptor handed to the trusted client out-of-band

use serde::Serialize;

/// Port value signalling that no real listener port is being advertised.
pub const DEV_PORT_SENTINEL: i32 = -1;

/// Immutable record of the bound port and the shared API token.
///
/// Development mode is derived: it is active when the port is
/// [`DEV_PORT_SENTINEL`] or the token is empty. It cannot be set directly.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    port: i32,
    token: String,
}

impl ConnectionDescriptor {
    pub fn new(port: i32, token: impl Into<String>) -> Self {
        Self {
            port,
            token: token.into(),
        }
    }

    /// Descriptor for a development-mode gateway.
    pub fn development() -> Self {
        Self::new(DEV_PORT_SENTINEL, "")
    }

    /// Descriptor for a production gateway with a freshly generated token.
    ///
    /// Fails only when the OS random source is unavailable.
    pub fn with_random_token(port: u16) -> Result<Self, getrandom::Error> {
        Ok(Self::new(i32::from(port), generate_token()?))
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_dev(&self) -> bool {
        self.port == DEV_PORT_SENTINEL || self.token.is_empty()
    }

    /// The exact `Authorization` header value a client must send.
    pub fn expected_authorization(&self) -> String {
        format!("Basic {}", self.token)
    }

    /// JSON line published on stdout for the client process.
    pub fn announcement(&self) -> Announcement<'_> {
        Announcement {
            port: self.port,
            token: &self.token,
            dev_mode: self.is_dev(),
        }
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("port", &self.port)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("dev_mode", &self.is_dev())
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement<'a> {
    pub port: i32,
    pub token: &'a str,
    pub dev_mode: bool,
}

/// Length of the API token in random bytes.
const TOKEN_BYTES: usize = 32;

/// 256 bits from the OS CSPRNG rendered as 64 lowercase hex characters.
fn generate_token() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_mode_derivation() {
        assert!(ConnectionDescriptor::new(-1, "abc").is_dev());
        assert!(ConnectionDescriptor::new(8080, "").is_dev());
        assert!(ConnectionDescriptor::new(-1, "").is_dev());
        assert!(!ConnectionDescriptor::new(8080, "abc").is_dev());
        assert!(!ConnectionDescriptor::new(0, "abc").is_dev());
    }

    #[test]
    fn test_development_descriptor() {
        let d = ConnectionDescriptor::development();
        assert!(d.is_dev());
        assert_eq!(d.port(), DEV_PORT_SENTINEL);
    }

    #[test]
    fn test_random_token_is_not_dev() {
        let d = ConnectionDescriptor::with_random_token(4242).unwrap();
        assert!(!d.is_dev());
        assert_eq!(d.port(), 4242);
        assert_ne!(
            d.token(),
            ConnectionDescriptor::with_random_token(4242).unwrap().token()
        );
    }

    #[test]
    fn test_generated_token_is_64_lowercase_hex() {
        let token = generate_token().unwrap();
        assert_eq!(token.len(), 2 * TOKEN_BYTES);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_generated_tokens_differ() {
        let tokens: std::collections::HashSet<String> =
            (0..16).map(|_| generate_token().unwrap()).collect();
        assert_eq!(tokens.len(), 16);
    }

    #[test]
    fn test_expected_authorization() {
        let d = ConnectionDescriptor::new(1, "secret");
        assert_eq!(d.expected_authorization(), "Basic secret");
    }

    #[test]
    fn test_debug_hides_token() {
        let d = ConnectionDescriptor::new(1, "supersecret");
        let dbg = format!("{:?}", d);
        assert!(!dbg.contains("supersecret"));
        assert!(dbg.contains("dev_mode: false"));
    }

    #[test]
    fn test_announcement_json() {
        let d = ConnectionDescriptor::new(9000, "tok");
        let json = serde_json::to_value(d.announcement()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"port": 9000, "token": "tok", "devMode": false})
        );
    }
}
