//! Pure outcome classification for backoff decisions.
//!
//! A driver populates either the result's error (network-level failure) or
//! its status code; the engine maps whichever is present onto an
//! [`ErrorClass`] and reacts accordingly.

use crate::driver::DriverError;

/// Category of a task outcome, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Success — resets the domain's backoff state.
    None,
    /// Worth retrying the domain after backoff (429, 5xx, network errors).
    Transient,
    /// The domain is fine but this request is hopeless (other 4xx).
    Permanent,
    /// Cancellation propagation — dropped silently.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::None => "none",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Classifies an HTTP-style status code.
///
/// Used for both HTTP responses and DNS RCODEs (remapped to this space by
/// the DNS driver). A zero status is the "no status" sentinel produced by
/// network-level paths and is treated as transient.
pub fn classify_status(code: u16) -> ErrorClass {
    match code {
        429 | 502 | 503 | 504 => ErrorClass::Transient,
        400 | 403 | 404 => ErrorClass::Permanent,
        0 => ErrorClass::Transient,
        c if (200..300).contains(&c) => ErrorClass::None,
        c if c >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Classifies a driver error, if any.
///
/// Only cancellation of the engine's token is fatal; every other error is a
/// transient condition of the remote or the network.
pub fn classify_error(err: Option<&DriverError>) -> ErrorClass {
    match err {
        None => ErrorClass::None,
        Some(DriverError::Cancelled) => ErrorClass::Fatal,
        Some(_) => ErrorClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_are_none() {
        for code in [200, 201, 204, 299] {
            assert_eq!(classify_status(code), ErrorClass::None, "code {code}");
        }
    }

    #[test]
    fn throttle_and_server_errors_are_transient() {
        for code in [429, 500, 502, 503, 504, 599] {
            assert_eq!(classify_status(code), ErrorClass::Transient, "code {code}");
        }
    }

    #[test]
    fn zero_status_is_transient() {
        assert_eq!(classify_status(0), ErrorClass::Transient);
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400, 401, 403, 404, 410, 451] {
            assert_eq!(classify_status(code), ErrorClass::Permanent, "code {code}");
        }
    }

    #[test]
    fn redirects_are_permanent() {
        // Drivers follow redirects themselves; a surfaced 3xx is not retryable.
        assert_eq!(classify_status(301), ErrorClass::Permanent);
        assert_eq!(classify_status(308), ErrorClass::Permanent);
    }

    #[test]
    fn absent_error_is_none() {
        assert_eq!(classify_error(None), ErrorClass::None);
    }

    #[test]
    fn cancellation_is_fatal() {
        assert_eq!(
            classify_error(Some(&DriverError::Cancelled)),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn other_errors_are_transient() {
        assert_eq!(
            classify_error(Some(&DriverError::Connect("refused".into()))),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_error(Some(&DriverError::Timeout(15))),
            ErrorClass::Transient
        );
    }
}
