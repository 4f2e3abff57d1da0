//! Application-ticket parsing and validation.
//!
//! Tickets arrive as an opaque binary blob: a length-prefixed GC-token
//! section, optionally followed by a session section and an ownership
//! section (version, account id, app id, IPs, license and DLC lists), and
//! terminated by a 128-byte RSA signature over the ownership bytes,
//! SHA-1 digested and checked against the platform's public key. The key
//! is injected at construction rather than baked in.

use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// RSA-1024 signature length.
pub const SIGNATURE_LEN: usize = 128;

const GC_TOKEN_LEN: usize = 20;
const SESSION_HEADER_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket truncated at {0}")]
    Truncated(&'static str),
    #[error("section length {got} out of bounds (expected {expected})")]
    BadSectionLength { expected: usize, got: usize },
    #[error("invalid RSA public key")]
    BadPublicKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("ticket carries no signature")]
    Unsigned,
}

/// The GC-token section of a ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcToken {
    pub token_id: u64,
    pub account_id: u64,
    pub token_generated: u32,
}

/// One DLC entry in the ownership section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlcEntry {
    pub app_id: u32,
    pub licenses: Vec<u32>,
}

/// The ownership section of a ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipTicket {
    pub version: u32,
    pub account_id: u64,
    pub app_id: u32,
    pub public_ip: u32,
    pub internal_ip: u32,
    pub flags: u32,
    pub issue_time: u32,
    pub expire_time: u32,
    pub licenses: Vec<u32>,
    pub dlcs: Vec<DlcEntry>,
}

/// A fully parsed application ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppTicket {
    pub gc_token: Option<GcToken>,
    pub ownership: Option<OwnershipTicket>,
    /// Raw bytes the signature covers (the ownership section).
    signed_bytes: Vec<u8>,
    signature: Option<[u8; SIGNATURE_LEN]>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], TicketError> {
        if self.remaining() < len {
            return Err(TicketError::Truncated(what));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u16_le(&mut self, what: &'static str) -> Result<u16, TicketError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self, what: &'static str) -> Result<u32, TicketError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self, what: &'static str) -> Result<u64, TicketError> {
        let bytes = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }
}

impl AppTicket {
    /// Parse a ticket blob. Sections beyond the GC token are optional; the
    /// signature is required only when [`TicketValidator::verify`] runs.
    pub fn parse(data: &[u8]) -> Result<Self, TicketError> {
        let mut cur = Cursor::new(data);

        // GC-token section: u32 length, then the token body.
        let gc_len = cur.u32_le("gc token length")? as usize;
        let gc_token = if gc_len == GC_TOKEN_LEN {
            let mut body = Cursor::new(cur.take(gc_len, "gc token")?);
            let token = GcToken {
                token_id: body.u64_le("token id")?,
                account_id: body.u64_le("account id")?,
                token_generated: body.u32_le("token generated")?,
            };
            // The session header follows the GC token; its contents are
            // connection metadata the transport does not interpret.
            let session_len = cur.u32_le("session length")? as usize;
            if session_len != SESSION_HEADER_LEN {
                return Err(TicketError::BadSectionLength {
                    expected: SESSION_HEADER_LEN,
                    got: session_len,
                });
            }
            cur.take(session_len, "session header")?;
            Some(token)
        } else if gc_len == 0 {
            None
        } else {
            return Err(TicketError::BadSectionLength {
                expected: GC_TOKEN_LEN,
                got: gc_len,
            });
        };

        if cur.remaining() == 0 {
            return Ok(Self {
                gc_token,
                ownership: None,
                signed_bytes: Vec::new(),
                signature: None,
            });
        }

        // Ownership section: u32 length counts itself.
        let ownership_start = cur.pos;
        let own_len = cur.u32_le("ownership length")? as usize;
        if own_len < 4 || own_len > cur.remaining() + 4 {
            return Err(TicketError::BadSectionLength {
                expected: cur.remaining() + 4,
                got: own_len,
            });
        }
        let version = cur.u32_le("version")?;
        let account_id = cur.u64_le("account id")?;
        let app_id = cur.u32_le("app id")?;
        let public_ip = cur.u32_le("public ip")?;
        let internal_ip = cur.u32_le("internal ip")?;
        let flags = cur.u32_le("flags")?;
        let issue_time = cur.u32_le("issue time")?;
        let expire_time = cur.u32_le("expire time")?;

        let license_count = cur.u16_le("license count")? as usize;
        let mut licenses = Vec::with_capacity(license_count.min(256));
        for _ in 0..license_count {
            licenses.push(cur.u32_le("license")?);
        }

        let dlc_count = cur.u16_le("dlc count")? as usize;
        let mut dlcs = Vec::with_capacity(dlc_count.min(256));
        for _ in 0..dlc_count {
            let app_id = cur.u32_le("dlc app id")?;
            let dlc_license_count = cur.u16_le("dlc license count")? as usize;
            let mut dlc_licenses = Vec::with_capacity(dlc_license_count.min(256));
            for _ in 0..dlc_license_count {
                dlc_licenses.push(cur.u32_le("dlc license")?);
            }
            dlcs.push(DlcEntry {
                app_id,
                licenses: dlc_licenses,
            });
        }
        // Reserved trailer inside the ownership section.
        cur.u16_le("ownership trailer")?;

        let signed_end = ownership_start + own_len;
        if signed_end > data.len() || cur.pos > signed_end {
            return Err(TicketError::BadSectionLength {
                expected: cur.pos - ownership_start,
                got: own_len,
            });
        }
        let signed_bytes = data[ownership_start..signed_end].to_vec();
        cur.pos = signed_end;

        let signature = if cur.remaining() >= SIGNATURE_LEN {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(cur.take(SIGNATURE_LEN, "signature")?);
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            gc_token,
            ownership: Some(OwnershipTicket {
                version,
                account_id,
                app_id,
                public_ip,
                internal_ip,
                flags,
                issue_time,
                expire_time,
                licenses,
                dlcs,
            }),
            signed_bytes,
            signature,
        })
    }

    pub fn has_signature(&self) -> bool {
        self.signature.is_some()
    }
}

/// Verifies ticket signatures against an injected RSA public key.
pub struct TicketValidator {
    public_key: RsaPublicKey,
}

impl TicketValidator {
    /// Build from raw big-endian modulus and exponent bytes.
    pub fn new(modulus: &[u8], exponent: &[u8]) -> Result<Self, TicketError> {
        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(exponent);
        let public_key = RsaPublicKey::new(n, e).map_err(|_| TicketError::BadPublicKey)?;
        Ok(Self { public_key })
    }

    pub fn from_key(public_key: RsaPublicKey) -> Self {
        Self { public_key }
    }

    /// Verify the ownership-section signature: PKCS#1 v1.5 over a SHA-1
    /// digest of the signed bytes.
    pub fn verify(&self, ticket: &AppTicket) -> Result<(), TicketError> {
        let Some(signature) = ticket.signature.as_ref() else {
            return Err(TicketError::Unsigned);
        };
        let digest = Sha1::digest(&ticket.signed_bytes);
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .map_err(|_| TicketError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    fn sample_ownership_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&2u32.to_le_bytes()); // version
        body.extend_from_slice(&76561198000000001u64.to_le_bytes());
        body.extend_from_slice(&480u32.to_le_bytes()); // app id
        body.extend_from_slice(&0x0A00_0001u32.to_le_bytes());
        body.extend_from_slice(&0xC0A8_0001u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        body.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        body.extend_from_slice(&1_700_600_000u32.to_le_bytes());
        body.extend_from_slice(&2u16.to_le_bytes()); // licenses
        body.extend_from_slice(&101u32.to_le_bytes());
        body.extend_from_slice(&102u32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes()); // dlcs
        body.extend_from_slice(&481u32.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&201u32.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // trailer
        body
    }

    fn build_ticket(sign_with: Option<&RsaPrivateKey>) -> Vec<u8> {
        let mut data = Vec::new();
        // GC token section.
        data.extend_from_slice(&20u32.to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEF_0000_0001u64.to_le_bytes());
        data.extend_from_slice(&76561198000000001u64.to_le_bytes());
        data.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        // Session header.
        data.extend_from_slice(&24u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 24]);

        // Ownership section, length counts itself.
        let body = sample_ownership_body();
        let own_len = (body.len() + 4) as u32;
        let ownership_start = data.len();
        data.extend_from_slice(&own_len.to_le_bytes());
        data.extend_from_slice(&body);

        if let Some(key) = sign_with {
            let digest = Sha1::digest(&data[ownership_start..]);
            let signature = key
                .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
                .expect("signing succeeds");
            data.extend_from_slice(&signature);
        }
        data
    }

    fn test_key() -> RsaPrivateKey {
        let mut rng = ChaCha20Rng::seed_from_u64(4242);
        RsaPrivateKey::new(&mut rng, 1024).expect("key generation")
    }

    #[test]
    fn parses_all_sections() {
        let data = build_ticket(None);
        let ticket = AppTicket::parse(&data).unwrap();

        let gc = ticket.gc_token.as_ref().unwrap();
        assert_eq!(gc.account_id, 76561198000000001);

        let own = ticket.ownership.as_ref().unwrap();
        assert_eq!(own.app_id, 480);
        assert_eq!(own.licenses, vec![101, 102]);
        assert_eq!(own.dlcs.len(), 1);
        assert_eq!(own.dlcs[0].app_id, 481);
        assert_eq!(own.dlcs[0].licenses, vec![201]);
        assert!(!ticket.has_signature());
    }

    #[test]
    fn signature_round_trip() {
        let key = test_key();
        let data = build_ticket(Some(&key));
        let ticket = AppTicket::parse(&data).unwrap();
        assert!(ticket.has_signature());

        let validator = TicketValidator::new(
            &key.to_public_key().n().to_bytes_be(),
            &key.to_public_key().e().to_bytes_be(),
        )
        .unwrap();
        validator.verify(&ticket).unwrap();
    }

    #[test]
    fn tampered_ticket_fails_verification() {
        let key = test_key();
        let mut data = build_ticket(Some(&key));
        // Flip a bit inside the ownership section.
        let len = data.len();
        data[len - SIGNATURE_LEN - 10] ^= 0x01;
        let ticket = AppTicket::parse(&data).unwrap();

        let validator = TicketValidator::from_key(key.to_public_key());
        assert_eq!(validator.verify(&ticket).unwrap_err(), TicketError::BadSignature);
    }

    #[test]
    fn unsigned_ticket_cannot_verify() {
        let key = test_key();
        let data = build_ticket(None);
        let ticket = AppTicket::parse(&data).unwrap();
        let validator = TicketValidator::from_key(key.to_public_key());
        assert_eq!(validator.verify(&ticket).unwrap_err(), TicketError::Unsigned);
    }

    #[test]
    fn truncated_ticket_is_rejected() {
        let data = build_ticket(None);
        assert!(AppTicket::parse(&data[..10]).is_err());
        assert!(AppTicket::parse(&[]).is_err());
    }

    #[test]
    fn bad_section_length_is_rejected() {
        let mut data = build_ticket(None);
        // Corrupt the GC-token length field.
        data[0] = 7;
        assert!(matches!(
            AppTicket::parse(&data),
            Err(TicketError::BadSectionLength { .. })
        ));
    }

    #[test]
    fn gc_token_only_ticket() {
        let mut data = Vec::new();
        data.extend_from_slice(&20u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(&24u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 24]);
        let ticket = AppTicket::parse(&data).unwrap();
        assert!(ticket.gc_token.is_some());
        assert!(ticket.ownership.is_none());
    }
}
