// SPDX-License-Identifier: MIT
//! HMAC-SHA256 signing for relay URLs (spec §4.11: "signed HMAC URL with
//! 5-min TTL"). The signature covers `<id>.<exp>` so neither field can be
//! tampered with independently of the other.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn sign(key: &[u8], id: &str, exp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(signing_input(id, exp).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(key: &[u8], id: &str, exp: i64, sig: &str) -> bool {
    let Ok(given) = hex::decode(sig) else { return false };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(signing_input(id, exp).as_bytes());
    mac.verify_slice(&given).is_ok()
}

fn signing_input(id: &str, exp: i64) -> String {
    format!("{id}.{exp}")
}
