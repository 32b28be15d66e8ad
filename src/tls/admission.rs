//! Handshake admission control: in-flight cap plus a per-client token
//! bucket. Loop-thread only, no locks.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::config::HandshakeAdmissionConfig;
use crate::tls::reason;

struct TokenBucket {
    tokens: f64,
    refilled: Instant,
}

pub(crate) struct HandshakeAdmission {
    config: HandshakeAdmissionConfig,
    in_flight: u32,
    buckets: AHashMap<IpAddr, TokenBucket>,
}

impl HandshakeAdmission {
    pub(crate) fn new(config: HandshakeAdmissionConfig) -> Self {
        Self {
            config,
            in_flight: 0,
            buckets: AHashMap::new(),
        }
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Admit a new handshake or name the rejection reason.
    pub(crate) fn try_admit(
        &mut self,
        peer: IpAddr,
        now: Instant,
    ) -> Result<(), &'static str> {
        if self.config.max_in_flight != 0 && self.in_flight >= self.config.max_in_flight {
            return Err(reason::REJECTED_CONCURRENCY);
        }

        if self.config.rate_tokens_per_sec > 0.0 {
            let burst = f64::from(self.config.rate_burst.max(1));
            let rate = self.config.rate_tokens_per_sec;
            let bucket = self.buckets.entry(peer).or_insert(TokenBucket {
                tokens: burst,
                refilled: now,
            });
            let elapsed = now.saturating_duration_since(bucket.refilled).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
            bucket.refilled = now;
            if bucket.tokens < 1.0 {
                return Err(reason::REJECTED_RATE_LIMIT);
            }
            bucket.tokens -= 1.0;
        }

        self.in_flight += 1;
        Ok(())
    }

    /// Release one handshake slot (success or failure alike).
    pub(crate) fn release(&mut self) {
        debug_assert!(self.in_flight > 0);
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Drop buckets idle long enough to have fully refilled.
    pub(crate) fn sweep(&mut self, now: Instant) {
        if self.config.rate_tokens_per_sec <= 0.0 {
            return;
        }
        let full_refill =
            Duration::from_secs_f64(f64::from(self.config.rate_burst.max(1)) / self.config.rate_tokens_per_sec);
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.refilled) < full_refill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn concurrency_cap_enforced() {
        let mut admission = HandshakeAdmission::new(HandshakeAdmissionConfig {
            max_in_flight: 2,
            ..HandshakeAdmissionConfig::default()
        });
        let now = Instant::now();
        assert!(admission.try_admit(ip(1), now).is_ok());
        assert!(admission.try_admit(ip(2), now).is_ok());
        assert_eq!(
            admission.try_admit(ip(3), now),
            Err(reason::REJECTED_CONCURRENCY)
        );
        admission.release();
        assert!(admission.try_admit(ip(3), now).is_ok());
    }

    #[test]
    fn per_client_rate_limit() {
        let mut admission = HandshakeAdmission::new(HandshakeAdmissionConfig {
            rate_tokens_per_sec: 1.0,
            rate_burst: 2,
            ..HandshakeAdmissionConfig::default()
        });
        let now = Instant::now();
        assert!(admission.try_admit(ip(1), now).is_ok());
        assert!(admission.try_admit(ip(1), now).is_ok());
        assert_eq!(
            admission.try_admit(ip(1), now),
            Err(reason::REJECTED_RATE_LIMIT)
        );
        // a different client has its own bucket
        assert!(admission.try_admit(ip(2), now).is_ok());
        // a second elapses, one token refills
        let later = now + Duration::from_secs(1);
        assert!(admission.try_admit(ip(1), later).is_ok());
    }

    #[test]
    fn zero_config_admits_everything() {
        let mut admission = HandshakeAdmission::new(HandshakeAdmissionConfig::default());
        let now = Instant::now();
        for i in 0..100 {
            assert!(admission.try_admit(ip(i), now).is_ok());
        }
        assert_eq!(admission.in_flight(), 100);
    }

    #[test]
    fn sweep_drops_idle_buckets() {
        let mut admission = HandshakeAdmission::new(HandshakeAdmissionConfig {
            rate_tokens_per_sec: 10.0,
            rate_burst: 5,
            ..HandshakeAdmissionConfig::default()
        });
        let now = Instant::now();
        let _ = admission.try_admit(ip(1), now);
        assert_eq!(admission.buckets.len(), 1);
        admission.sweep(now + Duration::from_secs(60));
        assert!(admission.buckets.is_empty());
    }
}
