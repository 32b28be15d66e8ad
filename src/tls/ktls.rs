//! Kernel TLS record offload (Linux).
//!
//! After a completed handshake the extracted traffic secrets are installed
//! with `setsockopt(SOL_TLS)`, after which the kernel frames and encrypts
//! records itself and `sendfile` can serve file bodies without user-space
//! record formation. The uapi constants and crypto_info layouts below are
//! stable kernel ABI.

use std::io;
use std::os::fd::RawFd;

use rustls::{ConnectionTrafficSecrets, ExtractedSecrets, ProtocolVersion};

const SOL_TCP: libc::c_int = 6;
const TCP_ULP: libc::c_int = 31;
const SOL_TLS: libc::c_int = 282;
const TLS_TX: libc::c_int = 1;
const TLS_RX: libc::c_int = 2;

const TLS_1_2_VERSION: u16 = 0x0303;
const TLS_1_3_VERSION: u16 = 0x0304;

const TLS_CIPHER_AES_GCM_128: u16 = 51;
const TLS_CIPHER_AES_GCM_256: u16 = 52;
const TLS_CIPHER_CHACHA20_POLY1305: u16 = 54;

#[repr(C)]
struct TlsCryptoInfo {
    version: u16,
    cipher_type: u16,
}

#[repr(C)]
struct TlsCryptoInfoAesGcm128 {
    info: TlsCryptoInfo,
    iv: [u8; 8],
    key: [u8; 16],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

#[repr(C)]
struct TlsCryptoInfoAesGcm256 {
    info: TlsCryptoInfo,
    iv: [u8; 8],
    key: [u8; 32],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

#[repr(C)]
struct TlsCryptoInfoChacha20Poly1305 {
    info: TlsCryptoInfo,
    iv: [u8; 12],
    key: [u8; 32],
    salt: [u8; 0],
    rec_seq: [u8; 8],
}

/// Whether the negotiated parameters can be handed to the kernel.
pub(crate) fn cipher_supported(version: Option<ProtocolVersion>, suite_name: &str) -> bool {
    if !matches!(
        version,
        Some(ProtocolVersion::TLSv1_2 | ProtocolVersion::TLSv1_3)
    ) {
        return false;
    }
    suite_name.contains("AES_128_GCM")
        || suite_name.contains("AES_256_GCM")
        || suite_name.contains("CHACHA20_POLY1305")
}

/// Attach the kernel TLS ULP to the socket. Must succeed before secrets are
/// extracted — this step failing is the clean fallback point.
pub(crate) fn attach_ulp(fd: RawFd) -> io::Result<()> {
    const ULP_NAME: &[u8] = b"tls\0";
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_TCP,
            TCP_ULP,
            ULP_NAME.as_ptr().cast(),
            (ULP_NAME.len() - 1) as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Install both traffic directions. The rustls connection is already gone
/// by the time this runs; any failure here means the connection must close.
pub(crate) fn install_secrets(
    fd: RawFd,
    version: ProtocolVersion,
    secrets: ExtractedSecrets,
) -> io::Result<()> {
    let (tx_seq, tx) = secrets.tx;
    let (rx_seq, rx) = secrets.rx;
    install_direction(fd, TLS_TX, version, tx_seq, &tx)?;
    install_direction(fd, TLS_RX, version, rx_seq, &rx)
}

fn install_direction(
    fd: RawFd,
    direction: libc::c_int,
    version: ProtocolVersion,
    seq: u64,
    secrets: &ConnectionTrafficSecrets,
) -> io::Result<()> {
    let version = match version {
        ProtocolVersion::TLSv1_2 => TLS_1_2_VERSION,
        ProtocolVersion::TLSv1_3 => TLS_1_3_VERSION,
        _ => return Err(io::Error::other("protocol version not offloadable")),
    };
    let rec_seq = seq.to_be_bytes();

    match secrets {
        ConnectionTrafficSecrets::Aes128Gcm { key, iv } => {
            let mut info = TlsCryptoInfoAesGcm128 {
                info: TlsCryptoInfo {
                    version,
                    cipher_type: TLS_CIPHER_AES_GCM_128,
                },
                iv: [0; 8],
                key: [0; 16],
                salt: [0; 4],
                rec_seq,
            };
            let iv = iv.as_ref();
            info.salt.copy_from_slice(&iv[..4]);
            info.iv.copy_from_slice(&iv[4..12]);
            info.key.copy_from_slice(key.as_ref());
            set_crypto_info(fd, direction, &info)
        }
        ConnectionTrafficSecrets::Aes256Gcm { key, iv } => {
            let mut info = TlsCryptoInfoAesGcm256 {
                info: TlsCryptoInfo {
                    version,
                    cipher_type: TLS_CIPHER_AES_GCM_256,
                },
                iv: [0; 8],
                key: [0; 32],
                salt: [0; 4],
                rec_seq,
            };
            let iv = iv.as_ref();
            info.salt.copy_from_slice(&iv[..4]);
            info.iv.copy_from_slice(&iv[4..12]);
            info.key.copy_from_slice(key.as_ref());
            set_crypto_info(fd, direction, &info)
        }
        ConnectionTrafficSecrets::Chacha20Poly1305 { key, iv } => {
            let mut info = TlsCryptoInfoChacha20Poly1305 {
                info: TlsCryptoInfo {
                    version,
                    cipher_type: TLS_CIPHER_CHACHA20_POLY1305,
                },
                iv: [0; 12],
                key: [0; 32],
                salt: [],
                rec_seq,
            };
            info.iv.copy_from_slice(iv.as_ref());
            info.key.copy_from_slice(key.as_ref());
            set_crypto_info(fd, direction, &info)
        }
        _ => Err(io::Error::other("cipher not offloadable")),
    }
}

fn set_crypto_info<T>(fd: RawFd, direction: libc::c_int, info: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_TLS,
            direction,
            std::ptr::from_ref(info).cast(),
            size_of::<T>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
