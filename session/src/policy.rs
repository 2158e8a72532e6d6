//! Close-code retry policy for the connecting side.

use tether_wire::CloseCode;

use crate::error::SessionError;

/// What the reconnect controller does with a finished connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Schedule the next backoff attempt
    Retry,
    /// Stop quietly; the closure was deliberate or unremarkable
    Stop,
    /// Stop and surface an error event
    StopWithError(SessionError),
}

/// Classify a close against the caller's extra retryable codes.
///
/// `code` is `None` when the channel ended without a close frame, which is
/// treated as an abnormal closure. The well-known codes keep their fixed
/// meaning regardless of the caller list; only codes outside that set can
/// be declared retryable.
pub fn classify_close(code: Option<u16>, retryable: &[u16]) -> Disposition {
    let code = match code {
        Some(raw) => CloseCode::from_u16(raw),
        None => CloseCode::Abnormal,
    };
    match code {
        CloseCode::Normal | CloseCode::GoingAway | CloseCode::ProtocolError | CloseCode::NoStatus => {
            Disposition::Stop
        }
        CloseCode::Abnormal | CloseCode::InvalidData => Disposition::Retry,
        CloseCode::PolicyViolation => {
            Disposition::StopWithError(SessionError::AuthenticationRejected)
        }
        CloseCode::UnsupportedData | CloseCode::MessageTooLarge | CloseCode::InternalError => {
            Disposition::StopWithError(SessionError::Terminated(code))
        }
        CloseCode::Other(raw) => {
            if retryable.contains(&raw) {
                Disposition::Retry
            } else {
                Disposition::StopWithError(SessionError::Terminated(code))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliberate_closures_stop_quietly() {
        for code in [1000, 1001, 1002, 1005] {
            assert_eq!(classify_close(Some(code), &[]), Disposition::Stop, "code {code}");
        }
    }

    #[test]
    fn test_abnormal_closures_retry() {
        assert_eq!(classify_close(Some(1006), &[]), Disposition::Retry);
        assert_eq!(classify_close(Some(1007), &[]), Disposition::Retry);
        assert_eq!(classify_close(None, &[]), Disposition::Retry);
    }

    #[test]
    fn test_message_failures_stop_with_error() {
        for code in [1003, 1009, 1011] {
            match classify_close(Some(code), &[]) {
                Disposition::StopWithError(SessionError::Terminated(terminated)) => {
                    assert_eq!(terminated.as_u16(), code);
                }
                other => panic!("code {code} classified as {other:?}"),
            }
        }
    }

    #[test]
    fn test_policy_violation_reports_rejected_auth() {
        assert_eq!(
            classify_close(Some(1008), &[]),
            Disposition::StopWithError(SessionError::AuthenticationRejected)
        );
    }

    #[test]
    fn test_policy_violation_ignores_caller_list() {
        assert_eq!(
            classify_close(Some(1008), &[1008]),
            Disposition::StopWithError(SessionError::AuthenticationRejected)
        );
    }

    #[test]
    fn test_caller_list_makes_custom_codes_retryable() {
        assert_eq!(classify_close(Some(4000), &[4000]), Disposition::Retry);
    }

    #[test]
    fn test_unknown_codes_stop_with_error() {
        match classify_close(Some(4000), &[]) {
            Disposition::StopWithError(SessionError::Terminated(code)) => {
                assert_eq!(code.as_u16(), 4000);
            }
            other => panic!("classified as {other:?}"),
        }
    }
}
