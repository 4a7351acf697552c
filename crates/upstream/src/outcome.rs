use std::time::Duration;

/// Sub-classification of non-retryable upstream rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// 401/403: the access token is invalid or expired. The message fails;
    /// token refresh is signalled out-of-band.
    Auth,
    /// Recipient-level rejection (not in allowed list, not a WhatsApp user).
    Recipient,
    /// The upstream rejected the payload shape.
    Schema,
    /// Messaging quota exhausted for the number.
    Quota,
    Other,
}

/// Classified result of one upstream send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx with a message id: the upstream accepted the hand-off.
    Accepted { upstream_message_id: String },
    /// 429: back off, and feed `retry_after` into the rate limiter.
    RateLimited { retry_after: Option<Duration> },
    /// 5xx / timeout / connection failure / unparseable 2xx body.
    Transient {
        retry_after: Option<Duration>,
        reason: String,
    },
    /// 4xx other than 429: retrying cannot help.
    Permanent {
        code: i64,
        reason: String,
        kind: PermanentKind,
    },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }
}

/// Upstream error codes that indicate a transient condition even when the
/// HTTP status alone would not.
const TRANSIENT_ERROR_CODES: &[i64] = &[
    1,      // unknown error
    2,      // service temporarily unavailable
    368,    // temporarily blocked
    130472, // spam rate limit, clears on its own
];

/// Error codes the upstream documents as recipient-level rejections.
const RECIPIENT_ERROR_CODES: &[i64] = &[131026, 131030, 131047, 131052];

/// Quota-exhaustion error codes (per-number messaging limit reached).
const QUOTA_ERROR_CODES: &[i64] = &[4, 17, 80007, 130429, 131048, 131056];

/// Classify a non-2xx response into an outcome, given the HTTP status,
/// the upstream error code/message, and an optional Retry-After.
pub(crate) fn classify_failure(
    status: u16,
    error_code: i64,
    error_message: String,
    retry_after: Option<Duration>,
) -> Outcome {
    match status {
        429 => Outcome::RateLimited { retry_after },
        401 | 403 => Outcome::Permanent {
            code: error_code,
            reason: error_message,
            kind: PermanentKind::Auth,
        },
        500..=599 => Outcome::Transient {
            retry_after,
            reason: format!("upstream {status}: {error_message}"),
        },
        _ if TRANSIENT_ERROR_CODES.contains(&error_code) => Outcome::Transient {
            retry_after,
            reason: format!("upstream code {error_code}: {error_message}"),
        },
        _ if QUOTA_ERROR_CODES.contains(&error_code) => Outcome::Permanent {
            code: error_code,
            reason: error_message,
            kind: PermanentKind::Quota,
        },
        _ if RECIPIENT_ERROR_CODES.contains(&error_code) => Outcome::Permanent {
            code: error_code,
            reason: error_message,
            kind: PermanentKind::Recipient,
        },
        _ => Outcome::Permanent {
            code: error_code,
            reason: error_message,
            kind: if status == 400 {
                PermanentKind::Schema
            } else {
                PermanentKind::Other
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_maps_to_rate_limited() {
        let outcome = classify_failure(429, 130429, "rate hit".into(), Some(Duration::from_secs(7)));
        assert_eq!(
            outcome,
            Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[test]
    fn test_auth_statuses_map_to_permanent_auth() {
        for status in [401u16, 403] {
            let outcome = classify_failure(status, 190, "expired".into(), None);
            assert!(matches!(
                outcome,
                Outcome::Permanent {
                    kind: PermanentKind::Auth,
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_5xx_maps_to_transient() {
        for status in [500u16, 502, 503, 504] {
            assert!(matches!(
                classify_failure(status, 2, "down".into(), None),
                Outcome::Transient { .. }
            ));
        }
    }

    #[test]
    fn test_recipient_error_is_permanent() {
        let outcome = classify_failure(400, 131030, "not in allowed list".into(), None);
        assert!(matches!(
            outcome,
            Outcome::Permanent {
                kind: PermanentKind::Recipient,
                code: 131030,
                ..
            }
        ));
    }

    #[test]
    fn test_transient_code_overrides_400() {
        let outcome = classify_failure(400, 368, "temporarily blocked".into(), None);
        assert!(matches!(outcome, Outcome::Transient { .. }));
    }

    #[test]
    fn test_unknown_400_is_schema_rejection() {
        let outcome = classify_failure(400, 100, "invalid parameter".into(), None);
        assert!(matches!(
            outcome,
            Outcome::Permanent {
                kind: PermanentKind::Schema,
                ..
            }
        ));
    }
}
