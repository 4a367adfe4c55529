//! Advisory per-device locks.
//!
//! Each lock is a directory under the lock root, named by the device's slug;
//! `mkdir` is the acquire primitive, so acquisition is atomic without any
//! daemon. The directory holds an `info` document identifying the holder.
//!
//! Locks are advisory. Mutating commands warn and proceed when a foreign
//! live holder exists; only `checkout` treats one as fatal.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Default lock lifetime when the holder does not say otherwise.
pub const DEFAULT_TTL_SECS: u64 = 1800;

/// Poll cadence for `checkout --wait`.
const WAIT_POLL: Duration = Duration::from_secs(2);

/// Lock directory name for a device: lowercase, non-alphanumerics replaced
/// with underscores. Idempotent (`slug(slug(x)) == slug(x)`).
pub fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Contents of a lock's `info` document.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub pid: i32,
    pub owner: String,
    pub timestamp: String,
    pub purpose: String,
    pub ttl: u64,
}

impl LockInfo {
    fn render(&self) -> String {
        format!(
            "PID={}\nOWNER={}\nTIMESTAMP={}\nPURPOSE={}\nTTL={}\n",
            self.pid, self.owner, self.timestamp, self.purpose, self.ttl
        )
    }

    fn parse(text: &str) -> LockInfo {
        let mut info = LockInfo {
            pid: 0,
            owner: String::new(),
            timestamp: String::new(),
            purpose: String::new(),
            ttl: DEFAULT_TTL_SECS,
        };
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "PID" => info.pid = value.trim().parse().unwrap_or(0),
                "OWNER" => info.owner = value.trim().to_string(),
                "TIMESTAMP" => info.timestamp = value.trim().to_string(),
                "PURPOSE" => info.purpose = value.trim().to_string(),
                "TTL" => info.ttl = value.trim().parse().unwrap_or(DEFAULT_TTL_SECS),
                _ => {}
            }
        }
        info
    }

    /// A lock is stale once its process is gone or its TTL has elapsed.
    pub fn is_stale(&self) -> bool {
        if self.pid <= 0 || !pid_alive(self.pid) {
            return true;
        }
        match OffsetDateTime::parse(&self.timestamp, &Rfc3339) {
            Ok(ts) => OffsetDateTime::now_utc() > ts + Duration::from_secs(self.ttl),
            // Unreadable timestamp: treat as expired rather than wedging
            // the device forever.
            Err(_) => true,
        }
    }
}

/// Liveness probe: the no-op signal succeeds only for a running process.
fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// One row of `locks` output.
#[derive(Debug)]
pub struct LockEntry {
    pub slug: String,
    pub info: LockInfo,
    pub stale: bool,
}

/// Result of a successful checkout.
#[derive(Debug)]
pub struct CheckoutOutcome {
    /// The stale lock that was reclaimed to make room, if any.
    pub reclaimed: Option<LockInfo>,
}

#[derive(Debug, Default, Clone)]
pub struct CheckoutOptions {
    pub owner: Option<String>,
    pub purpose: Option<String>,
    pub ttl: Option<u64>,
    pub wait: bool,
    pub wait_timeout: Option<Duration>,
}

/// Lock manager rooted at one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
}

enum Acquire {
    Acquired(Option<LockInfo>),
    Held(LockInfo),
}

impl LockManager {
    pub fn new(root: &Path) -> LockManager {
        LockManager {
            root: root.to_path_buf(),
        }
    }

    fn lock_dir(&self, name: &str) -> PathBuf {
        self.root.join(slug(name))
    }

    fn read_info(&self, dir: &Path) -> Option<LockInfo> {
        fs::read_to_string(dir.join("info"))
            .ok()
            .map(|t| LockInfo::parse(&t))
    }

    /// The live holder of a device's lock, if one exists. Stale locks do
    /// not count as held.
    pub fn holder(&self, name: &str) -> Option<LockInfo> {
        let info = self.read_info(&self.lock_dir(name))?;
        (!info.is_stale()).then_some(info)
    }

    fn try_acquire(&self, name: &str, info: &LockInfo) -> Result<Acquire> {
        fs::create_dir_all(&self.root)?;
        let dir = self.lock_dir(name);

        let mut reclaimed = None;
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match self.read_info(&dir) {
                    Some(existing) if !existing.is_stale() => {
                        return Ok(Acquire::Held(existing));
                    }
                    existing => {
                        // Stale (or info-less) lock: reclaim it.
                        debug!(device = name, "Reclaiming stale lock");
                        reclaimed = existing;
                        fs::remove_dir_all(&dir)?;
                        fs::create_dir(&dir)?;
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        fs::write(dir.join("info"), info.render())?;
        Ok(Acquire::Acquired(reclaimed))
    }

    /// Acquire a device's lock, optionally waiting for a live holder to let
    /// go. Stale locks are reclaimed silently (reported in the outcome).
    pub async fn checkout(&self, name: &str, opts: &CheckoutOptions) -> Result<CheckoutOutcome> {
        let info = LockInfo {
            pid: std::process::id() as i32,
            owner: opts.owner.clone().unwrap_or_else(config::default_owner),
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            purpose: opts.purpose.clone().unwrap_or_default(),
            ttl: opts.ttl.unwrap_or(DEFAULT_TTL_SECS),
        };

        let deadline = opts
            .wait
            .then(|| tokio::time::Instant::now() + opts.wait_timeout.unwrap_or(WAIT_POLL * 30));

        loop {
            match self.try_acquire(name, &info)? {
                Acquire::Acquired(reclaimed) => return Ok(CheckoutOutcome { reclaimed }),
                Acquire::Held(existing) => match deadline {
                    Some(d) if tokio::time::Instant::now() + WAIT_POLL <= d => {
                        debug!(
                            device = name,
                            owner = %existing.owner,
                            "Lock held, waiting"
                        );
                        tokio::time::sleep(WAIT_POLL).await;
                    }
                    _ => {
                        return Err(Error::LockConflict {
                            name: name.to_string(),
                            owner: existing.owner,
                            purpose: if existing.purpose.is_empty() {
                                "-".to_string()
                            } else {
                                existing.purpose
                            },
                        });
                    }
                },
            }
        }
    }

    /// Release a device's lock. Releasing a lock that does not exist
    /// succeeds silently; releasing a foreign live lock requires `force`.
    pub fn checkin(&self, name: &str, force: bool) -> Result<()> {
        let dir = self.lock_dir(name);
        let Some(info) = self.read_info(&dir) else {
            // Missing directory or unreadable info: nothing worth keeping.
            return match fs::remove_dir_all(&dir) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        };

        let own = info.pid == std::process::id() as i32;
        if !own && !info.is_stale() && !force {
            return Err(Error::LockConflict {
                name: name.to_string(),
                owner: info.owner,
                purpose: if info.purpose.is_empty() {
                    "-".to_string()
                } else {
                    info.purpose
                },
            });
        }

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// All locks under the root, stale ones flagged.
    pub fn list(&self) -> Result<Vec<LockEntry>> {
        let mut entries = Vec::new();
        let read = match fs::read_dir(&self.root) {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        for entry in read {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let slug = entry.file_name().to_string_lossy().to_string();
            let Some(info) = self.read_info(&entry.path()) else {
                continue;
            };
            let stale = info.is_stale();
            entries.push(LockEntry { slug, info, stale });
        }
        entries.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, LockManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(dir.path());
        (dir, mgr)
    }

    #[test]
    fn slug_is_lowercase_underscored_and_idempotent() {
        assert_eq!(slug("Device A"), "device_a");
        assert_eq!(slug("MPCB 1.9 Development"), "mpcb_1_9_development");
        assert_eq!(slug(&slug("Device A")), slug("Device A"));
    }

    #[tokio::test]
    async fn checkout_then_list_then_checkin() {
        let (_dir, mgr) = manager();
        let outcome = mgr
            .checkout("Device A", &CheckoutOptions::default())
            .await
            .unwrap();
        assert!(outcome.reclaimed.is_none());

        let entries = mgr.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].slug, "device_a");
        assert!(!entries[0].stale);

        mgr.checkin("Device A", false).unwrap();
        assert!(mgr.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn own_live_lock_blocks_second_checkout() {
        let (_dir, mgr) = manager();
        mgr.checkout("Device A", &CheckoutOptions::default())
            .await
            .unwrap();

        // Same process counts as a live holder; checkout is not reentrant.
        let err = mgr
            .checkout("Device A", &CheckoutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));
    }

    #[tokio::test]
    async fn dead_pid_lock_is_reclaimed() {
        let (_dir, mgr) = manager();
        let dir = mgr.lock_dir("Device A");
        fs::create_dir_all(&dir).unwrap();
        // PID 99999999 is outside the default pid_max on Linux.
        fs::write(
            dir.join("info"),
            "PID=99999999\nOWNER=ghost@nowhere\nTIMESTAMP=2026-01-01T00:00:00Z\nPURPOSE=\nTTL=1800\n",
        )
        .unwrap();

        let outcome = mgr
            .checkout("Device A", &CheckoutOptions::default())
            .await
            .unwrap();
        let reclaimed = outcome.reclaimed.unwrap();
        assert_eq!(reclaimed.owner, "ghost@nowhere");

        // The new lock belongs to us now.
        let holder = mgr.holder("Device A").unwrap();
        assert_eq!(holder.pid, std::process::id() as i32);
    }

    #[tokio::test]
    async fn expired_ttl_makes_lock_stale() {
        let (_dir, mgr) = manager();
        let dir = mgr.lock_dir("Device A");
        fs::create_dir_all(&dir).unwrap();
        // Live PID (our own), but the TTL elapsed long ago.
        fs::write(
            dir.join("info"),
            format!(
                "PID={}\nOWNER=me@here\nTIMESTAMP=2020-01-01T00:00:00Z\nPURPOSE=old\nTTL=60\n",
                std::process::id()
            ),
        )
        .unwrap();

        assert!(mgr.holder("Device A").is_none());
        let outcome = mgr
            .checkout("Device A", &CheckoutOptions::default())
            .await
            .unwrap();
        assert!(outcome.reclaimed.is_some());
    }

    #[tokio::test]
    async fn checkin_missing_lock_succeeds_silently() {
        let (_dir, mgr) = manager();
        mgr.checkin("Device A", false).unwrap();
    }

    #[tokio::test]
    async fn checkin_foreign_live_lock_requires_force() {
        let (_dir, mgr) = manager();
        let dir = mgr.lock_dir("Device A");
        fs::create_dir_all(&dir).unwrap();
        // PID 1 is init: alive, never ours.
        fs::write(
            dir.join("info"),
            format!(
                "PID=1\nOWNER=other@host\nTIMESTAMP={}\nPURPOSE=testing\nTTL=86400\n",
                OffsetDateTime::now_utc().format(&Rfc3339).unwrap()
            ),
        )
        .unwrap();

        let err = mgr.checkin("Device A", false).unwrap_err();
        assert!(matches!(err, Error::LockConflict { .. }));

        mgr.checkin("Device A", true).unwrap();
        assert!(mgr.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn differently_cased_queries_converge_on_one_slug() {
        let (_dir, mgr) = manager();
        mgr.checkout("Device A", &CheckoutOptions::default())
            .await
            .unwrap();
        // The canonical registered name is what callers pass; slug() makes
        // case differences converge rather than alias.
        assert!(mgr.holder("DEVICE A").is_some());
    }
}
