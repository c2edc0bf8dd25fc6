//! Payment log decoding.
//!
//! Layout: 32-byte payer public key, 8-byte big-endian amount, UTF-8 memo.
//! Payloads that do not fit are non-payment calls and decode to `None`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha512_256};

use super::RawEvent;

const KEY_LEN: usize = 32;
const AMOUNT_LEN: usize = 8;
/// Smallest payload that can carry a payment.
pub const MIN_PAYLOAD_LEN: usize = KEY_LEN + AMOUNT_LEN;
const CHECKSUM_LEN: usize = 4;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A decoded payment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub event_id: String,
    pub position: u64,
    /// Payer address in ledger form.
    pub payer: String,
    /// Amount in base units.
    pub amount: u64,
    pub memo: String,
}

/// Decode a raw ledger event. Never fails; non-payments yield `None`.
pub fn decode(raw: &RawEvent) -> Option<PaymentEvent> {
    let payload = raw.payload.as_deref()?;
    let bytes = STANDARD.decode(payload).ok()?;
    let (payer, amount, memo) = decode_payload(&bytes)?;

    Some(PaymentEvent {
        event_id: raw.id.clone(),
        position: raw.position,
        payer,
        amount,
        memo,
    })
}

/// Decode the binary log layout into (payer, amount, memo).
pub fn decode_payload(bytes: &[u8]) -> Option<(String, u64, String)> {
    if bytes.len() < MIN_PAYLOAD_LEN {
        return None;
    }

    let key: &[u8; KEY_LEN] = bytes[..KEY_LEN].try_into().ok()?;
    let amount_bytes: [u8; AMOUNT_LEN] = bytes[KEY_LEN..MIN_PAYLOAD_LEN].try_into().ok()?;
    let amount = u64::from_be_bytes(amount_bytes);

    // Invalid sequences are dropped, not replaced
    let memo = String::from_utf8_lossy(&bytes[MIN_PAYLOAD_LEN..]).replace(char::REPLACEMENT_CHARACTER, "");

    Some((encode_address(key), amount, memo))
}

/// Render a public key as a ledger address: base32(key || checksum), unpadded.
///
/// The checksum is the last four bytes of SHA-512/256(key).
pub fn encode_address(key: &[u8; KEY_LEN]) -> String {
    let digest = Sha512_256::digest(key);
    let mut buf = Vec::with_capacity(KEY_LEN + CHECKSUM_LEN);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&digest[digest.len() - CHECKSUM_LEN..]);
    base32_unpadded(&buf)
}

fn base32_unpadded(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
        acc &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: [u8; 32], amount: u64, memo: &[u8]) -> Vec<u8> {
        let mut bytes = key.to_vec();
        bytes.extend_from_slice(&amount.to_be_bytes());
        bytes.extend_from_slice(memo);
        bytes
    }

    fn raw(bytes: &[u8]) -> RawEvent {
        RawEvent {
            id: "TX1".to_string(),
            position: 9,
            payload: Some(STANDARD.encode(bytes)),
        }
    }

    #[test]
    fn test_encode_address_known_vectors() {
        assert_eq!(
            encode_address(&[0u8; 32]),
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAY5HFKQ"
        );

        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let address = encode_address(&key);
        assert_eq!(address, "AAAQEAYEAUDAOCAJBIFQYDIOB4IBCEQTCQKRMFYYDENBWHA5DYP7MUPJQE");
        assert_eq!(address.len(), 58);
    }

    #[test]
    fn test_decode_full_payment() {
        let event = decode(&raw(&payload([0u8; 32], 500_000, b"ORDER:17"))).unwrap();
        assert_eq!(event.event_id, "TX1");
        assert_eq!(event.position, 9);
        assert_eq!(event.amount, 500_000);
        assert_eq!(event.memo, "ORDER:17");
        assert_eq!(event.payer.len(), 58);
    }

    #[test]
    fn test_decode_exactly_forty_bytes_has_empty_memo() {
        let event = decode(&raw(&payload([7u8; 32], 1, b""))).unwrap();
        assert_eq!(event.amount, 1);
        assert_eq!(event.memo, "");
    }

    #[test]
    fn test_short_payloads_are_not_events() {
        for len in [0usize, 1, 32, 39] {
            assert!(decode_payload(&vec![0xAB; len]).is_none(), "len {len}");
            assert!(decode(&raw(&vec![0xAB; len])).is_none(), "len {len}");
        }
    }

    #[test]
    fn test_missing_or_garbled_payload_is_not_an_event() {
        let mut event = raw(&payload([0u8; 32], 1, b""));
        event.payload = None;
        assert!(decode(&event).is_none());

        event.payload = Some("***not base64***".to_string());
        assert!(decode(&event).is_none());
    }

    #[test]
    fn test_invalid_utf8_in_memo_is_dropped() {
        let (_, _, memo) = decode_payload(&payload([0u8; 32], 1, b"hi\xff\xfethere")).unwrap();
        assert_eq!(memo, "hithere");
    }
}
