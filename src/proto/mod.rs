//! Message contracts of the catalog service.
//!
//! There are two versions of the contract, [v1] and [v2]. They have the same
//! four calls and the same interaction patterns, v2 just carries more fields.
//! Both are served on one endpoint through the outer [CatalogService].
use std::time::{SystemTime, UNIX_EPOCH};

use derive_more::{From, TryInto};
use serde::{Deserialize, Serialize};

use crate::Service;

pub mod v1;
pub mod v2;

/// The outer service spoken on the wire.
///
/// Clients and server channels are mapped down to [v1::CatalogApiV1] or
/// [v2::CatalogApiV2].
#[derive(Debug, Clone, Copy)]
pub struct CatalogService;

/// Any request of any contract version
#[allow(missing_docs)]
#[derive(Debug, Serialize, Deserialize, From, TryInto)]
pub enum CatalogRequest {
    V1(v1::Request),
    V2(v2::Request),
}

/// Any response of any contract version
#[allow(missing_docs)]
#[derive(Debug, Serialize, Deserialize, From, TryInto)]
pub enum CatalogResponse {
    V1(v1::Response),
    V2(v2::Response),
}

impl Service for CatalogService {
    type Req = CatalogRequest;
    type Res = CatalogResponse;
}

/// Milliseconds since the unix epoch, as carried in every timestamp field.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A fresh correlation id: 128 random bits as 32 lowercase hex digits.
pub fn new_correlation_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Returns `id` unless it is empty or only whitespace.
pub(crate) fn non_blank(id: &str) -> Option<&str> {
    if id.trim().is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_32_hex_digits() {
        let a = new_correlation_id();
        let b = new_correlation_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn blank_means_whitespace_only() {
        assert_eq!(non_blank(""), None);
        assert_eq!(non_blank(" \t"), None);
        assert_eq!(non_blank(" x "), Some(" x "));
    }
}
