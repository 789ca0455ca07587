//! Backend address parsing.
//!
//! A backend is configured with a single address string of the form
//! `scheme://host[:port][/apiPathPrefix]`. The scheme selects plaintext
//! (`grpc`) or TLS without certificate verification (`grpcs`); the optional
//! path is prepended to every method name sent on the connection.

use std::fmt;

use url::Url;

use crate::error::{BackendError, BackendResult};

/// Port dialed when the address names none, as gRPC's name resolver does.
pub const DEFAULT_PORT: u16 = 443;

/// Parsed backend address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    /// Host name or IP literal (IPv6 keeps its brackets)
    pub host: String,
    /// Explicit port, if the address had one
    pub port: Option<u16>,
    /// Method path prefix, empty when the address had no path
    pub api_path_prefix: String,
    /// TLS (`grpcs`) or plaintext (`grpc`)
    pub secure: bool,
}

impl TargetDescriptor {
    /// Parse `scheme://host[:port][/apiPathPrefix]`.
    ///
    /// ```
    /// # use refcol_core::TargetDescriptor;
    /// let target = TargetDescriptor::parse("grpcs://edge.internal:8443/billing").unwrap();
    /// assert_eq!(target.authority(), "edge.internal:8443");
    /// assert_eq!(target.api_path_prefix, "/billing");
    /// assert!(target.secure);
    /// ```
    pub fn parse(address: &str) -> BackendResult<Self> {
        let invalid = |reason: &str| BackendError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;

        let secure = match url.scheme() {
            "grpc" => false,
            "grpcs" => true,
            _ => return Err(invalid("scheme must be grpc or grpcs")),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials are not allowed"));
        }

        let api_path_prefix = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            host,
            port: url.port(),
            api_path_prefix,
            secure,
        })
    }

    /// `host:port` used to dial, with the default port filled in
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(DEFAULT_PORT))
    }

    /// Host name presented for TLS server name indication
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Whether calls on this target need method-name rewriting
    pub fn has_path_prefix(&self) -> bool {
        !self.api_path_prefix.is_empty()
    }

    /// Key identifying the physical connection this target rides on
    pub fn connection_key(&self) -> (String, bool) {
        (self.authority(), self.secure)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "grpcs" } else { "grpc" };
        write!(f, "{}://{}{}", scheme, self.authority(), self.api_path_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plaintext_without_prefix() {
        let target = TargetDescriptor::parse("grpc://orders.internal:50051").unwrap();
        assert_eq!(target.host, "orders.internal");
        assert_eq!(target.port, Some(50051));
        assert_eq!(target.api_path_prefix, "");
        assert!(!target.secure);
        assert!(!target.has_path_prefix());
    }

    #[test]
    fn parse_secure_with_prefix() {
        let target = TargetDescriptor::parse("grpcs://edge.internal/billing/v2/").unwrap();
        assert!(target.secure);
        assert_eq!(target.authority(), "edge.internal:443");
        assert_eq!(target.api_path_prefix, "/billing/v2");
    }

    #[test]
    fn parse_ipv6_literal() {
        let target = TargetDescriptor::parse("grpc://[::1]:9000").unwrap();
        assert_eq!(target.authority(), "[::1]:9000");
        assert_eq!(target.server_name(), "::1");
    }

    #[test]
    fn reject_unknown_scheme() {
        let err = TargetDescriptor::parse("http://orders:80").unwrap_err();
        assert!(matches!(err, BackendError::InvalidAddress { .. }));
    }

    #[test]
    fn reject_missing_scheme() {
        assert!(TargetDescriptor::parse("orders:50051").is_err());
        assert!(TargetDescriptor::parse("").is_err());
    }

    #[test]
    fn reject_query() {
        assert!(TargetDescriptor::parse("grpc://orders:1/x?y=1").is_err());
    }

    #[test]
    fn same_host_shares_connection_key() {
        let a = TargetDescriptor::parse("grpcs://edge:443/a").unwrap();
        let b = TargetDescriptor::parse("grpcs://edge/b").unwrap();
        let c = TargetDescriptor::parse("grpc://edge:443/a").unwrap();
        assert_eq!(a.connection_key(), b.connection_key());
        assert_ne!(a.connection_key(), c.connection_key());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let target = TargetDescriptor::parse("grpcs://edge:8443/billing").unwrap();
        assert_eq!(target.to_string(), "grpcs://edge:8443/billing");
    }
}
