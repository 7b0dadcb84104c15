//! Viewer identity cookie
//!
//! Issues and reads the opaque per-browser id used for view/like dedup.
//! The id is not an account: it only bounds "already counted" semantics.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use rand::Rng;

pub const VIEWER_COOKIE: &str = "pulse_vid";

const MIN_ID_LEN: usize = 10;
const MAX_ID_LEN: usize = 128;

/// Read the viewer id from the cookie jar. Never creates one.
///
/// Values that do not look like ids we minted (wrong length or
/// characters outside the URL-safe base64 alphabet) are ignored.
pub fn viewer_id(jar: &CookieJar) -> Option<String> {
    let value = jar.get(VIEWER_COOKIE)?.value().to_string();
    if is_valid_viewer_id(&value) {
        Some(value)
    } else {
        None
    }
}

/// Return the existing viewer id, or mint one and add the cookie to the jar.
///
/// The returned jar carries the new cookie, so later reads in the same
/// handler observe the id that was just set.
pub fn ensure_viewer_id(jar: CookieJar, production: bool) -> (CookieJar, String) {
    if let Some(id) = viewer_id(&jar) {
        return (jar, id);
    }

    let id = mint_viewer_id();
    let cookie = Cookie::build((VIEWER_COOKIE, id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(production)
        .max_age(time::Duration::days(365))
        .build();

    (jar.add(cookie), id)
}

fn mint_viewer_id() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn is_valid_viewer_id(value: &str) -> bool {
    (MIN_ID_LEN..=MAX_ID_LEN).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_id_round_trips() {
        let jar = CookieJar::new();
        let (jar, id) = ensure_viewer_id(jar, false);

        assert!(is_valid_viewer_id(&id));
        assert_eq!(viewer_id(&jar), Some(id.clone()));

        // Second call sees the existing cookie and does not mint a new id
        let (_, again) = ensure_viewer_id(jar, false);
        assert_eq!(again, id);
    }

    #[test]
    fn test_cookie_attributes() {
        let (jar, _) = ensure_viewer_id(CookieJar::new(), true);
        let cookie = jar.get(VIEWER_COOKIE).unwrap();

        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.max_age(), Some(time::Duration::days(365)));
    }

    #[test]
    fn test_garbage_cookie_is_ignored() {
        let jar = CookieJar::new().add(Cookie::new(VIEWER_COOKIE, "no spaces!"));
        assert_eq!(viewer_id(&jar), None);

        let jar = CookieJar::new().add(Cookie::new(VIEWER_COOKIE, "short"));
        assert_eq!(viewer_id(&jar), None);
    }
}
