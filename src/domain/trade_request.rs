//! Canonical `TradeRequest` produced by every ingress adapter (REST, queue,
//! file upload, manual entry) before it reaches the partition dispatcher.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::PstppError;

/// Origin of a `TradeRequest`, carried through to the persisted blotter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    Automated,
    Manual,
    File,
    Api,
    Queue,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Automated => "AUTOMATED",
            Source::Manual => "MANUAL",
            Source::File => "FILE",
            Source::Api => "API",
            Source::Queue => "QUEUE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Source {
    type Err = PstppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATED" => Ok(Source::Automated),
            "MANUAL" => Ok(Source::Manual),
            "FILE" => Ok(Source::File),
            "API" => Ok(Source::Api),
            "QUEUE" => Ok(Source::Queue),
            other => Err(PstppError::ProcessingError(format!("unknown source {other}"))),
        }
    }
}

/// Immutable, post-ingress representation of an inbound trade.
///
/// `partitionKey` is `{accountId}_{bookId}_{securityId}` and defines the
/// serialization domain the partition dispatcher (C9) routes this request
/// into. `idempotencyKey` defaults to `tradeId` when the caller omits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub trade_id: String,
    pub partition_key: String,
    pub idempotency_key: String,
    pub sequence_number: Option<u64>,
    pub booking_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub source: Source,
    pub payload: serde_json::Value,
    pub callback_url: Option<String>,
}

impl TradeRequest {
    /// Derive the partition key from its three constituent identifiers.
    pub fn derive_partition_key(account_id: &str, book_id: &str, security_id: &str) -> String {
        format!("{account_id}_{book_id}_{security_id}")
    }

    /// Build a request, defaulting `idempotency_key` to `trade_id` and
    /// validating the invariants from the data model: non-empty ids, a
    /// sequence number of at least 1 when present, and an absolute
    /// `callback_url` when present.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trade_id: String,
        partition_key: String,
        idempotency_key: Option<String>,
        sequence_number: Option<u64>,
        booking_timestamp: Option<chrono::DateTime<chrono::Utc>>,
        source: Source,
        payload: serde_json::Value,
        callback_url: Option<String>,
    ) -> Result<Self, PstppError> {
        if trade_id.is_empty() {
            return Err(PstppError::Validation("tradeId must not be empty".into()));
        }
        if partition_key.is_empty() {
            return Err(PstppError::Validation(
                "partitionKey must not be empty".into(),
            ));
        }
        let idempotency_key = idempotency_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| trade_id.clone());

        if let Some(seq) = sequence_number
            && seq < 1
        {
            return Err(PstppError::Validation(
                "sequenceNumber must be >= 1 when present".into(),
            ));
        }

        if let Some(ref url) = callback_url {
            validate_callback_url(url)?;
        }

        Ok(Self {
            trade_id,
            partition_key,
            idempotency_key,
            sequence_number,
            booking_timestamp,
            source,
            payload,
            callback_url,
        })
    }

    /// Whether this request carries an upstream sequence number, i.e.
    /// whether the Sequence Buffer (C3) should enforce ordering for it.
    pub fn is_sequenced(&self) -> bool {
        self.sequence_number.is_some()
    }
}

/// Validate that a callback URL is absolute, per spec.md §3.
pub fn validate_callback_url(raw: &str) -> Result<(), PstppError> {
    let url = Url::parse(raw).map_err(|_| {
        PstppError::Validation(format!("callbackUrl is not a valid URL: {raw}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(PstppError::Validation(format!(
            "callbackUrl must be an absolute http(s) URL: {raw}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_partition_key() {
        assert_eq!(
            TradeRequest::derive_partition_key("ACC1", "BOOK1", "SEC1"),
            "ACC1_BOOK1_SEC1"
        );
    }

    #[test]
    fn defaults_idempotency_key_to_trade_id() {
        let req = TradeRequest::new(
            "T1".into(),
            "A_B_C".into(),
            None,
            Some(1),
            None,
            Source::Api,
            serde_json::json!({}),
            Some("http://callback.example/cb".into()),
        )
        .unwrap();
        assert_eq!(req.idempotency_key, "T1");
    }

    #[test]
    fn rejects_empty_trade_id() {
        let err = TradeRequest::new(
            "".into(),
            "A_B_C".into(),
            None,
            None,
            None,
            Source::Api,
            serde_json::json!({}),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PstppError::Validation(_)));
    }

    #[test]
    fn rejects_sequence_number_below_one() {
        let err = TradeRequest::new(
            "T1".into(),
            "A_B_C".into(),
            None,
            Some(0),
            None,
            Source::Api,
            serde_json::json!({}),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PstppError::Validation(_)));
    }

    #[test]
    fn rejects_relative_callback_url() {
        let err = validate_callback_url("/relative/path").unwrap_err();
        assert!(matches!(err, PstppError::Validation(_)));
    }

    #[test]
    fn accepts_absolute_callback_url() {
        assert!(validate_callback_url("https://ops.example.com/hooks/1").is_ok());
    }

    #[test]
    fn source_display_and_parse_round_trip() {
        for s in [Source::Automated, Source::Manual, Source::File, Source::Api, Source::Queue] {
            let parsed: Source = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
