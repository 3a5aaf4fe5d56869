use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::proto::rr::RecordType;
use trust_dns_resolver::TokioAsyncResolver;

use footfall_core::{Driver, DriverError, Task, TaskResult};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// DNS driver querying the task's configured resolver over UDP.
///
/// RCODEs are remapped onto HTTP-style status codes so the engine's
/// status classification applies uniformly:
///
/// ```text
/// NOERROR  → 200
/// NXDOMAIN → 404
/// REFUSED  → 403
/// SERVFAIL → 503
/// other    → 502
/// ```
pub struct DnsDriver;

impl DnsDriver {
    pub fn new() -> Self {
        Self
    }

    async fn query(&self, task: &Task) -> Result<u16, DriverError> {
        let cfg = &task.config.dns;

        let resolver_addr = parse_resolver_addr(&cfg.resolver)?;
        let record_type = RecordType::from_str(&cfg.record_type.to_uppercase())
            .map_err(|_| {
            DriverError::InvalidTarget(format!("unknown DNS record type: {}", cfg.record_type))
        })?;

        let group = NameServerConfigGroup::from_ips_clear(
            &[resolver_addr.ip()],
            resolver_addr.port(),
            true,
        );
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = QUERY_TIMEOUT;
        opts.attempts = 1;

        let resolver = TokioAsyncResolver::tokio(config, opts);

        match resolver.lookup(task.url.as_str(), record_type).await {
            Ok(_) => Ok(200),
            Err(err) => map_resolve_error(err),
        }
    }
}

impl Default for DnsDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for DnsDriver {
    async fn execute(&self, cancel: &CancellationToken, task: Task) -> TaskResult {
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DriverError::Cancelled),
            outcome = self.query(&task) => outcome,
        };
        let duration = start.elapsed();

        match outcome {
            Ok(status_code) => TaskResult {
                task,
                status_code,
                duration,
                bytes_read: 0,
                error: None,
            },
            Err(error) => TaskResult::from_error(task, duration, error),
        }
    }
}

fn parse_resolver_addr(raw: &str) -> Result<SocketAddr, DriverError> {
    if let Ok(addr) = SocketAddr::from_str(raw) {
        return Ok(addr);
    }
    // A bare IP implies the standard DNS port.
    if let Ok(ip) = IpAddr::from_str(raw) {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(DriverError::InvalidTarget(format!(
        "invalid DNS resolver address: {raw:?}"
    )))
}

/// Maps a resolver failure onto the HTTP-like status space where the
/// server actually answered, and onto a driver error otherwise.
fn map_resolve_error(err: ResolveError) -> Result<u16, DriverError> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            Ok(rcode_to_http(*response_code))
        }
        ResolveErrorKind::Timeout => Err(DriverError::Timeout(QUERY_TIMEOUT.as_secs())),
        _ => Err(DriverError::Protocol(err.to_string())),
    }
}

fn rcode_to_http(rcode: ResponseCode) -> u16 {
    match rcode {
        ResponseCode::NoError => 200,
        ResponseCode::NXDomain => 404,
        ResponseCode::Refused => 403,
        ResponseCode::ServFail => 503,
        _ => 502,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcodes_map_to_http_space() {
        assert_eq!(rcode_to_http(ResponseCode::NoError), 200);
        assert_eq!(rcode_to_http(ResponseCode::NXDomain), 404);
        assert_eq!(rcode_to_http(ResponseCode::Refused), 403);
        assert_eq!(rcode_to_http(ResponseCode::ServFail), 503);
        assert_eq!(rcode_to_http(ResponseCode::NotImp), 502);
        assert_eq!(rcode_to_http(ResponseCode::FormErr), 502);
    }

    #[test]
    fn resolver_addr_accepts_ip_and_port() {
        assert_eq!(
            parse_resolver_addr("8.8.8.8:53").unwrap(),
            "8.8.8.8:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_resolver_addr("1.1.1.1").unwrap(),
            "1.1.1.1:53".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_resolver_addr("resolver.example:53").is_err());
    }

    #[tokio::test]
    async fn unknown_record_type_is_invalid_target() {
        let driver = DnsDriver::new();
        let cancel = CancellationToken::new();

        let mut task = Task {
            url: "example.com".into(),
            kind: footfall_core::TaskKind::Dns,
            config: Default::default(),
        };
        task.config.dns.record_type = "BOGUS".into();

        let result = driver.execute(&cancel, task).await;
        assert!(matches!(result.error, Some(DriverError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let driver = DnsDriver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let task = Task {
            url: "example.com".into(),
            kind: footfall_core::TaskKind::Dns,
            config: Default::default(),
        };
        let result = driver.execute(&cancel, task).await;
        assert!(matches!(result.error, Some(DriverError::Cancelled)));
    }
}
