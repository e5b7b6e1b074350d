use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::Write,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    str::FromStr,
};

use fs2::FileExt;
use thiserror::Error;

use crate::internal;

pub const DB_NAME: &str = "hash_greylist.dbm";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("greylist store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How rejections are issued. `TestOnly` runs the full bookkeeping but
/// never denies; `Off` short-circuits the whole policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    DenySoft,
    TestOnly,
    Off,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "denysoft" => Ok(Self::DenySoft),
            "testonly" => Ok(Self::TestOnly),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown greylist mode {other:?}")),
        }
    }
}

/// Greylist policy knobs, all durations in seconds.
#[derive(Debug, Clone)]
pub struct Params {
    pub black_timeout: u64,
    pub grey_timeout: u64,
    pub white_timeout: u64,
    pub max_size: u64,
    pub flush_period: u64,
    pub mode: Mode,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            black_timeout: 60,
            grey_timeout: 12_000,
            white_timeout: 3_110_400,
            max_size: 200_000,
            flush_period: 3_600,
            mode: Mode::default(),
        }
    }
}

impl Params {
    /// Parse whitespace-separated `key value` pairs, e.g.
    /// `black_timeout 60 mode testonly`. Unknown keys and unparsable
    /// values are logged and ignored.
    #[must_use]
    pub fn from_config_line(line: &str) -> Self {
        let mut params = Self::default();
        let mut words = line.split_ascii_whitespace();

        while let Some(key) = words.next() {
            let Some(value) = words.next() else {
                internal!(level = WARN, "greylist config: {key} has no value");
                break;
            };

            let seconds = |slot: &mut u64| match value.parse() {
                Ok(parsed) => *slot = parsed,
                Err(_) => internal!(level = WARN, "greylist config: bad value for {key}: {value}"),
            };

            match key {
                "black_timeout" => seconds(&mut params.black_timeout),
                "grey_timeout" => seconds(&mut params.grey_timeout),
                "white_timeout" => seconds(&mut params.white_timeout),
                "max_size" => seconds(&mut params.max_size),
                "flush_period" => seconds(&mut params.flush_period),
                "mode" => match value.parse() {
                    Ok(mode) => params.mode = mode,
                    Err(err) => internal!(level = WARN, "greylist config: {err}"),
                },
                other => internal!(level = WARN, "greylist config: unknown key {other}"),
            }
        }

        params
    }
}

/// `timestamp:count` as stored for fingerprint keys.
#[must_use]
pub fn format_entry(timestamp: u64, count: u32) -> String {
    format!("{timestamp}:{count}")
}

#[must_use]
pub fn parse_entry(value: &str) -> Option<(u64, u32)> {
    let (timestamp, count) = value.split_once(':')?;
    Some((timestamp.parse().ok()?, count.parse().ok()?))
}

/// A key is a fingerprint iff it is exactly 32 hex digits, anchored at
/// both ends.
#[must_use]
pub fn is_fingerprint(key: &str) -> bool {
    key.len() == 32 && key.bytes().all(|byte| byte.is_ascii_hexdigit())
}

#[must_use]
pub fn is_ip_key(key: &str) -> bool {
    key.parse::<Ipv4Addr>().is_ok()
}

const LASTFLUSHED: &str = "lastflushed";

/// Drop everything past its window and anything that should not be in
/// the store at all: stale IPs, stale or malformed fingerprints, keys of
/// neither kind.
pub fn sweep(map: &mut BTreeMap<String, String>, params: &Params, now: u64) {
    map.retain(|key, value| {
        if key == LASTFLUSHED {
            true
        } else if is_ip_key(key) {
            value
                .parse::<u64>()
                .is_ok_and(|seen| now.saturating_sub(seen) <= params.white_timeout)
        } else if is_fingerprint(key) {
            parse_entry(value)
                .is_some_and(|(seen, _)| now.saturating_sub(seen) <= params.grey_timeout)
        } else {
            false
        }
    });

    map.insert(LASTFLUSHED.to_owned(), now.to_string());
}

/// What the policy decided for one (IP, fingerprint) pair. The caller
/// maps deferrals to DENYSOFT (or a pass in testonly mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// The remote IP is within its white window; nothing else consulted.
    PassWhitelisted,
    /// Fingerprint aged into the grey window; the IP is now white.
    PassPromoted,
    /// Never seen: entry stored with count 1.
    DeferFirstContact,
    /// Retried inside the black window; entry rewritten with this count.
    DeferRetry(u32),
    /// Fingerprint older than the grey window; dropped, treated as new
    /// on the next attempt.
    DeferExpired,
}

impl Assessment {
    #[must_use]
    pub const fn passes(self) -> bool {
        matches!(self, Self::PassWhitelisted | Self::PassPromoted)
    }
}

/// The decision algorithm over the open store. Runs entirely under the
/// store lock; contains no suspension points.
pub fn assess(
    map: &mut BTreeMap<String, String>,
    params: &Params,
    now: u64,
    ip: Ipv4Addr,
    fingerprint: &str,
) -> Assessment {
    let last_flushed = map
        .get(LASTFLUSHED)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    if now.saturating_sub(last_flushed) > params.flush_period {
        sweep(map, params, now);
    }

    let ip_key = ip.to_string();
    if let Some(value) = map.get(&ip_key) {
        match value.parse::<u64>() {
            Ok(seen) if now.saturating_sub(seen) <= params.white_timeout => {
                return Assessment::PassWhitelisted;
            }
            _ => {
                map.remove(&ip_key);
            }
        }
    }

    match map.get(fingerprint).map(String::as_str).and_then(parse_entry) {
        None => {
            map.insert(fingerprint.to_owned(), format_entry(now, 1));
            Assessment::DeferFirstContact
        }
        Some((seen, count)) => {
            let age = now.saturating_sub(seen);

            if age < params.black_timeout {
                let count = count.saturating_add(1);
                map.insert(fingerprint.to_owned(), format_entry(now, count));
                Assessment::DeferRetry(count)
            } else if age < params.grey_timeout {
                map.remove(fingerprint);
                map.insert(ip_key, now.to_string());
                Assessment::PassPromoted
            } else {
                map.remove(fingerprint);
                Assessment::DeferExpired
            }
        }
    }
}

/// Handle to the on-disk store. `open` takes the companion lock file's
/// exclusive advisory lock, so one worker at a time reads or writes.
#[derive(Debug, Clone)]
pub struct Store {
    data_path: PathBuf,
    lock_path: PathBuf,
}

impl Store {
    #[must_use]
    pub fn new(db_dir: &Path) -> Self {
        let data_path = db_dir.join(DB_NAME);
        let lock_path = db_dir.join(format!("{DB_NAME}.lock"));

        Self {
            data_path,
            lock_path,
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.data_path.clone(),
            source,
        }
    }

    /// Lock, then load. Blocks the calling thread while another process
    /// holds the lock; callers on the reactor must run this on the
    /// blocking pool.
    pub fn open(&self) -> Result<Guard, StoreError> {
        if let Some(dir) = self.data_path.parent() {
            std::fs::create_dir_all(dir).map_err(|err| self.io_error(err))?;
        }

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| self.io_error(err))?;
        lock.lock_exclusive().map_err(|err| self.io_error(err))?;

        let mut map = BTreeMap::new();
        match std::fs::read_to_string(&self.data_path) {
            Ok(raw) => {
                for line in raw.lines() {
                    if let Some((key, value)) = line.split_once(' ') {
                        map.insert(key.to_owned(), value.to_owned());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                // Unlock before reporting; the caller fails open.
                let _ = fs2::FileExt::unlock(&lock);
                return Err(self.io_error(err));
            }
        }

        Ok(Guard {
            store: self.clone(),
            lock: Some(lock),
            map,
            dirty: false,
        })
    }
}

/// The locked, loaded store. Mutations mark it dirty; `close` persists
/// and releases the lock. Dropping without `close` (an error path)
/// still flushes best-effort and always releases the lock.
pub struct Guard {
    store: Store,
    lock: Option<File>,
    map: BTreeMap<String, String>,
    dirty: bool,
}

impl Guard {
    #[must_use]
    pub fn map(&self) -> &BTreeMap<String, String> {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.dirty = true;
        &mut self.map
    }

    fn flush(&self) -> Result<(), StoreError> {
        let mut serialized = String::new();
        for (key, value) in &self.map {
            serialized.push_str(key);
            serialized.push(' ');
            serialized.push_str(value);
            serialized.push('\n');
        }

        let mut file = File::create(&self.store.data_path)
            .map_err(|err| self.store.io_error(err))?;
        file.write_all(serialized.as_bytes())
            .map_err(|err| self.store.io_error(err))?;

        Ok(())
    }

    fn release(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = fs2::FileExt::unlock(&lock);
        }
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        let result = if self.dirty { self.flush() } else { Ok(()) };
        self.dirty = false;
        self.release();
        result
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(err) = self.flush() {
                internal!(level = ERROR, "greylist flush on drop failed: {err}");
            }
        }
        self.release();
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use super::*;

    const FP: &str = "0123456789abcdef0123456789abcdef";

    fn ip() -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, 1)
    }

    #[test]
    fn entry_round_trip() {
        assert_eq!(parse_entry(&format_entry(1_700_000_000, 3)), Some((1_700_000_000, 3)));
        assert_eq!(parse_entry("171:2"), Some((171, 2)));
        assert_eq!(parse_entry("171"), None);
        assert_eq!(parse_entry("171:two"), None);
        assert_eq!(parse_entry(":"), None);
    }

    #[test]
    fn fingerprint_match_is_anchored() {
        assert!(is_fingerprint(FP));
        assert!(!is_fingerprint(&FP[..31]));
        assert!(!is_fingerprint(&format!("{FP}0")));
        assert!(!is_fingerprint(&format!("x{}", &FP[1..])));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("denysoft".parse(), Ok(Mode::DenySoft));
        assert_eq!("TESTONLY".parse(), Ok(Mode::TestOnly));
        assert_eq!("off".parse(), Ok(Mode::Off));
        assert!("loud".parse::<Mode>().is_err());
    }

    #[test]
    fn params_from_config_line() {
        let params =
            Params::from_config_line("black_timeout 30 grey_timeout 600 mode testonly junk");
        assert_eq!(params.black_timeout, 30);
        assert_eq!(params.grey_timeout, 600);
        assert_eq!(params.mode, Mode::TestOnly);
        // Unspecified keys keep their defaults.
        assert_eq!(params.white_timeout, 3_110_400);
        assert_eq!(params.max_size, 200_000);
    }

    #[test]
    fn first_contact_then_black_then_promotion() {
        let params = Params::default();
        let mut map = BTreeMap::new();

        // Scenario: first contact defers and stores count 1.
        assert_eq!(assess(&mut map, &params, 1_000, ip(), FP), Assessment::DeferFirstContact);
        assert_eq!(map.get(FP).unwrap(), &format_entry(1_000, 1));

        // Retry inside the black window: count bumps, timestamp rewrites.
        assert_eq!(assess(&mut map, &params, 1_030, ip(), FP), Assessment::DeferRetry(2));
        assert_eq!(map.get(FP).unwrap(), &format_entry(1_030, 2));

        // Retry after black_timeout but inside the grey window: promoted.
        assert_eq!(assess(&mut map, &params, 1_100, ip(), FP), Assessment::PassPromoted);
        assert!(!map.contains_key(FP));
        assert_eq!(map.get(&ip().to_string()).unwrap(), "1100");

        // Any later mail from that IP passes without a fingerprint check.
        assert_eq!(
            assess(&mut map, &params, 2_000, ip(), "ffffffffffffffffffffffffffffffff"),
            Assessment::PassWhitelisted
        );
    }

    #[test]
    fn expired_fingerprint_is_dropped() {
        let params = Params::default();
        let mut map = BTreeMap::new();
        map.insert(FP.to_owned(), format_entry(0, 1));

        let now = params.grey_timeout + 10;
        assert_eq!(assess(&mut map, &params, now, ip(), FP), Assessment::DeferExpired);
        assert!(!map.contains_key(FP));

        // Next attempt is first contact again.
        assert_eq!(assess(&mut map, &params, now + 1, ip(), FP), Assessment::DeferFirstContact);
    }

    #[test]
    fn stale_ip_is_deleted_then_greylisted() {
        let params = Params::default();
        let mut map = BTreeMap::new();
        map.insert(LASTFLUSHED.to_owned(), "5000000".to_owned());
        map.insert(ip().to_string(), "0".to_owned());

        let now = 5_000_000;
        assert_eq!(assess(&mut map, &params, now, ip(), FP), Assessment::DeferFirstContact);
        assert!(!map.contains_key(&ip().to_string()));
    }

    #[test]
    fn exactly_one_of_ip_or_fingerprint_after_first_contact() {
        let params = Params::default();
        let mut map = BTreeMap::new();

        assess(&mut map, &params, 1_000, ip(), FP);

        let has_ip = map.contains_key(&ip().to_string());
        let has_fp = map.contains_key(FP);
        assert!(has_fp && !has_ip);
    }

    #[test]
    fn sweep_removes_stale_and_malformed() {
        let params = Params::default();
        let mut map = BTreeMap::new();
        let now = 10_000_000;

        map.insert("10.0.0.1".to_owned(), (now - 10).to_string()); // fresh IP
        map.insert("10.0.0.2".to_owned(), "0".to_owned()); // stale IP
        map.insert("10.0.0.3".to_owned(), "soon".to_owned()); // malformed value
        map.insert(FP.to_owned(), format_entry(now - 10, 1)); // fresh fp
        map.insert(
            "ffffffffffffffffffffffffffffffff".to_owned(),
            format_entry(0, 4),
        ); // stale fp
        map.insert("message_hash".to_owned(), "whatever".to_owned()); // malformed key

        sweep(&mut map, &params, now);

        assert!(map.contains_key("10.0.0.1"));
        assert!(!map.contains_key("10.0.0.2"));
        assert!(!map.contains_key("10.0.0.3"));
        assert!(map.contains_key(FP));
        assert!(!map.contains_key("ffffffffffffffffffffffffffffffff"));
        assert!(!map.contains_key("message_hash"));
        assert_eq!(map.get(LASTFLUSHED).unwrap(), &now.to_string());
    }

    #[test]
    fn assess_triggers_sweep_after_flush_period() {
        let params = Params::default();
        let mut map = BTreeMap::new();
        map.insert(LASTFLUSHED.to_owned(), "0".to_owned());
        map.insert("bogus key".to_owned(), "x".to_owned());

        let now = params.flush_period + 1;
        assess(&mut map, &params, now, ip(), FP);

        assert!(!map.contains_key("bogus key"));
        assert_eq!(map.get(LASTFLUSHED).unwrap(), &now.to_string());
    }

    #[test]
    fn store_round_trip_and_lock_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        {
            let mut guard = store.open().unwrap();
            guard.map_mut().insert(FP.to_owned(), format_entry(42, 1));
            guard.close().unwrap();
        }

        // Re-open: lock must be free again and data must have survived.
        let guard = store.open().unwrap();
        assert_eq!(guard.map().get(FP).unwrap(), &format_entry(42, 1));
        guard.close().unwrap();

        let raw = std::fs::read_to_string(dir.path().join(DB_NAME)).unwrap();
        assert_eq!(raw, format!("{FP} 42:1\n"));
    }

    #[test]
    fn open_missing_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let guard = store.open().unwrap();
        assert!(guard.map().is_empty());
        guard.close().unwrap();
    }
}
