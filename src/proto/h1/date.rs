use std::cell::RefCell;
use std::time::{Duration, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the current RFC 1123 date, re-rendered at most once a second.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(&cache.bytes);
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    rendered_at: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> CachedDate {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            rendered_at: SystemTime::UNIX_EPOCH,
        };
        cache.render(SystemTime::now());
        cache
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        let stale = now
            .duration_since(self.rendered_at)
            .map_or(true, |age| age >= Duration::from_secs(1));
        if stale {
            self.render(now);
        }
    }

    fn render(&mut self, now: SystemTime) {
        let formatted = httpdate::fmt_http_date(now);
        debug_assert_eq!(formatted.len(), DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(formatted.as_bytes());
        self.rendered_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_len() {
        assert_eq!(DATE_VALUE_LENGTH, "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }

    #[test]
    fn renders_rfc1123_gmt() {
        let mut buf = Vec::new();
        extend(&mut buf);
        assert_eq!(buf.len(), DATE_VALUE_LENGTH);
        assert!(buf.ends_with(b"GMT"));
        // weekday is always three letters followed by a comma
        assert_eq!(buf[3], b',');
    }
}
