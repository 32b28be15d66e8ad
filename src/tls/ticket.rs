//! Session ticket key ring.
//!
//! Up to `max_keys` 48-byte keys (16-byte key name + 32 bytes of AES-256-GCM
//! material). The newest key encrypts and decrypts, older keys decrypt only.
//! With automatic rotation a fresh key is generated every
//! `lifetime / max_keys`, evicting the oldest once the ring is full; a
//! static key disables rotation entirely.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use tracing::debug;

use crate::config::TicketConfig;
use crate::error::Error;

pub(crate) const TICKET_KEY_LEN: usize = 48;
const NAME_LEN: usize = 16;
const NONCE_LEN: usize = 12;

struct TicketKey {
    name: [u8; NAME_LEN],
    key: LessSafeKey,
}

impl TicketKey {
    fn from_bytes(bytes: &[u8; TICKET_KEY_LEN]) -> Result<Self, Error> {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&bytes[..NAME_LEN]);
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes[NAME_LEN..])
            .map_err(|_| Error::new_tls("invalid session ticket key material"))?;
        Ok(Self {
            name,
            key: LessSafeKey::new(unbound),
        })
    }

    fn generate() -> Result<Self, Error> {
        let mut bytes = [0u8; TICKET_KEY_LEN];
        aws_lc_rs::rand::fill(&mut bytes)
            .map_err(|_| Error::new_tls("session ticket key generation failed"))?;
        Self::from_bytes(&bytes)
    }
}

struct Ring {
    keys: VecDeque<TicketKey>,
    next_rotation: Option<Instant>,
}

pub(crate) struct RotatingTicketer {
    state: Mutex<Ring>,
    rotation_interval: Option<Duration>,
    max_keys: usize,
    lifetime_secs: u32,
}

impl RotatingTicketer {
    pub(crate) fn from_config(config: &TicketConfig) -> Result<Self, Error> {
        let (first, rotation_interval) = match config.static_key {
            Some(ref key) => (TicketKey::from_bytes(key)?, None),
            None => {
                let interval = config.lifetime / config.max_keys.max(1) as u32;
                (TicketKey::generate()?, Some(interval))
            }
        };
        let mut keys = VecDeque::with_capacity(config.max_keys.max(1));
        keys.push_front(first);
        Ok(Self {
            state: Mutex::new(Ring {
                keys,
                next_rotation: rotation_interval.map(|interval| Instant::now() + interval),
            }),
            rotation_interval,
            max_keys: config.max_keys.max(1),
            lifetime_secs: config.lifetime.as_secs().min(u64::from(u32::MAX)) as u32,
        })
    }

    fn maybe_rotate(&self, ring: &mut Ring, now: Instant) {
        let Some(interval) = self.rotation_interval else {
            return;
        };
        let Some(due) = ring.next_rotation else {
            return;
        };
        if now < due {
            return;
        }
        match TicketKey::generate() {
            Ok(key) => {
                ring.keys.push_front(key);
                while ring.keys.len() > self.max_keys {
                    ring.keys.pop_back();
                }
            }
            Err(err) => debug!("session ticket key rotation failed: {err}"),
        }
        ring.next_rotation = Some(now + interval);
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.state.lock().map(|ring| ring.keys.len()).unwrap_or(0)
    }
}

impl rustls::server::ProducesTickets for RotatingTicketer {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        self.lifetime_secs
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let mut ring = self.state.lock().ok()?;
        self.maybe_rotate(&mut ring, Instant::now());
        let current = ring.keys.front()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        aws_lc_rs::rand::fill(&mut nonce_bytes).ok()?;

        let mut out = Vec::with_capacity(NAME_LEN + NONCE_LEN + plain.len() + AES_256_GCM.tag_len());
        out.extend_from_slice(&current.name);
        out.extend_from_slice(&nonce_bytes);

        let mut sealed = plain.to_vec();
        current
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(current.name),
                &mut sealed,
            )
            .ok()?;
        out.extend_from_slice(&sealed);
        Some(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        if cipher.len() < NAME_LEN + NONCE_LEN {
            return None;
        }
        let (name, rest) = cipher.split_at(NAME_LEN);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let ring = self.state.lock().ok()?;
        let key = ring.keys.iter().find(|key| key.name == name)?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let mut aad = [0u8; NAME_LEN];
        aad.copy_from_slice(name);

        let mut in_out = sealed.to_vec();
        let plain = key
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .ok()?;
        Some(plain.to_vec())
    }
}

impl std::fmt::Debug for RotatingTicketer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingTicketer")
            .field("max_keys", &self.max_keys)
            .field("rotation_interval", &self.rotation_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::server::ProducesTickets;

    fn ticketer(config: TicketConfig) -> RotatingTicketer {
        RotatingTicketer::from_config(&config).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let t = ticketer(TicketConfig::default());
        let ticket = t.encrypt(b"session state").unwrap();
        assert_eq!(t.decrypt(&ticket).unwrap(), b"session state");
    }

    #[test]
    fn tampered_ticket_fails() {
        let t = ticketer(TicketConfig::default());
        let mut ticket = t.encrypt(b"session state").unwrap();
        let last = ticket.len() - 1;
        ticket[last] ^= 0x01;
        assert!(t.decrypt(&ticket).is_none());
    }

    #[test]
    fn unknown_key_name_fails() {
        let a = ticketer(TicketConfig::default());
        let b = ticketer(TicketConfig::default());
        let ticket = a.encrypt(b"state").unwrap();
        assert!(b.decrypt(&ticket).is_none());
    }

    #[test]
    fn static_key_is_stable_across_instances() {
        let key = [7u8; TICKET_KEY_LEN];
        let config = TicketConfig {
            static_key: Some(key),
            ..TicketConfig::default()
        };
        let a = ticketer(config.clone());
        let b = ticketer(config);
        let ticket = a.encrypt(b"resumable").unwrap();
        assert_eq!(b.decrypt(&ticket).unwrap(), b"resumable");
    }

    #[test]
    fn rotation_evicts_oldest_beyond_capacity() {
        let config = TicketConfig {
            enabled: true,
            lifetime: Duration::from_secs(0),
            max_keys: 2,
            static_key: None,
        };
        let t = ticketer(config);
        // each encrypt rotates (interval is zero)
        let first = t.encrypt(b"one").unwrap();
        let _ = t.encrypt(b"two").unwrap();
        let _ = t.encrypt(b"three").unwrap();
        assert_eq!(t.key_count(), 2);
        // the key that minted `first` has been evicted by now
        assert!(t.decrypt(&first).is_none());
    }

    #[test]
    fn static_key_never_rotates() {
        let config = TicketConfig {
            enabled: true,
            lifetime: Duration::from_secs(0),
            max_keys: 2,
            static_key: Some([9u8; TICKET_KEY_LEN]),
        };
        let t = ticketer(config);
        let ticket = t.encrypt(b"pinned").unwrap();
        let _ = t.encrypt(b"again").unwrap();
        assert_eq!(t.key_count(), 1);
        assert_eq!(t.decrypt(&ticket).unwrap(), b"pinned");
    }
}
