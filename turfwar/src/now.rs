//! Cached wall clock time for the Date header.
//!
//! Formatting a date for every response is wasted work when the value
//! only changes once a second, so a timer thread refreshes a shared
//! copy and the HTTP workers read it.
use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

/// How often (milliseconds) the timer thread refreshes the cache.
pub const DATE_UPDATE_MS: u64 = 500;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// IMF-fixdate as used by Date and Last-Modified headers.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use turfwar::now::http_date;
///
/// let t = Utc.with_ymd_and_hms(2022, 11, 6, 8, 49, 37).unwrap();
/// assert_eq!(http_date(&t), "Sun, 06 Nov 2022 08:49:37 GMT");
/// ```
pub fn http_date(t: &DateTime<Utc>) -> String {
    t.format(HTTP_DATE_FORMAT).to_string()
}

/// Same as http_date() for a filesystem-style timestamp.
pub fn http_date_from_system(t: SystemTime) -> String {
    http_date(&DateTime::<Utc>::from(t))
}

#[derive(Debug, Clone)]
struct Nowish {
    time: DateTime<Utc>,
    http_date: String,
}

impl Nowish {
    fn current() -> Nowish {
        let time = Utc::now();
        let http_date = http_date(&time);
        Nowish { time, http_date }
    }
}

pub struct NowCache {
    nowish: RwLock<Nowish>,
}

impl Default for NowCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NowCache {
    pub fn new() -> NowCache {
        NowCache {
            nowish: RwLock::new(Nowish::current()),
        }
    }

    /// Recompute the time.  Formatting happens before we take the lock.
    pub fn update(&self) {
        let fresh = Nowish::current();
        let mut nowish = self.nowish.write().unwrap_or_else(PoisonError::into_inner);
        *nowish = fresh;
    }

    /// Append the cached Date header value to a buffer.
    pub fn write_http_date(&self, out: &mut Vec<u8>) {
        let nowish = self.nowish.read().unwrap_or_else(PoisonError::into_inner);
        out.extend_from_slice(nowish.http_date.as_bytes());
    }

    /// Cached epoch seconds.
    pub fn epoch_secs(&self) -> i64 {
        let nowish = self.nowish.read().unwrap_or_else(PoisonError::into_inner);
        nowish.time.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_tracks_updates() {
        let cache = NowCache::new();
        let before = cache.epoch_secs();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(cache.epoch_secs(), before);

        cache.update();
        assert!(cache.epoch_secs() > before);

        let mut buf = b"Date: ".to_vec();
        cache.write_http_date(&mut buf);
        assert!(buf.ends_with(b" GMT"));
        assert_eq!(buf.len(), "Date: ".len() + 29);
    }
}
