//! Signed cookie values.
//!
//! A signed value has the form `s:<value>.<signature>`, where the signature
//! is the unpadded base64 HMAC-SHA256 of `<value>` under a secret key. This
//! is the format used by `express-session`, so cookies can be shared with
//! services speaking it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::SecretKey;

type CookieHmac = Hmac<Sha256>;

const SIGNED_PREFIX: &str = "s:";

fn signature(value: &str, key: &SecretKey) -> Vec<u8> {
    let mut mac =
        CookieHmac::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(value.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn sign(value: &str, key: &SecretKey) -> String {
    let signature = STANDARD_NO_PAD.encode(signature(value, key));
    format!("{SIGNED_PREFIX}{value}.{signature}")
}

/// Returns the original value if `signed` carries a valid signature under
/// any of `keys`.
pub(crate) fn unsign<'a, 'k, I>(signed: &'a str, keys: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'k SecretKey>,
{
    let (value, signature_b64) = signed.strip_prefix(SIGNED_PREFIX)?.rsplit_once('.')?;
    let provided = STANDARD_NO_PAD.decode(signature_b64).ok()?;

    keys.into_iter()
        .any(|key| bool::from(signature(value, key).ct_eq(&provided)))
        .then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_known_vector() {
        // same output as express' cookie-signature for ("hello", "tobiiscool")
        let signed = sign("hello", &SecretKey::from("tobiiscool"));

        assert_eq!(
            signed,
            "s:hello.DGDUkGlIkCzPz+C0B064FNgHdEjox7ch8tOBGslZ5QI"
        );
    }

    #[test]
    fn unsign_valid() {
        let key = SecretKey::from("secret");
        let signed = sign("session-id", &key);

        assert_eq!(unsign(&signed, [&key]), Some("session-id"));
    }

    #[test]
    fn unsign_fallback_key() {
        let old = SecretKey::from("old");
        let new = SecretKey::from("new");
        let signed = sign("session-id", &old);

        assert_eq!(unsign(&signed, [&new]), None);
        assert_eq!(unsign(&signed, [&new, &old]), Some("session-id"));
    }

    #[test]
    fn unsign_tampered() {
        let key = SecretKey::from("secret");
        let signed = sign("session-id", &key).replace("session-id", "session-ie");

        assert_eq!(unsign(&signed, [&key]), None);
    }

    #[test]
    fn unsign_malformed() {
        let key = SecretKey::from("secret");

        assert_eq!(unsign("session-id", [&key]), None);
        assert_eq!(unsign("s:session-id", [&key]), None);
        assert_eq!(unsign("s:session-id.!!!", [&key]), None);
    }
}
