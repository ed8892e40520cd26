//! Version Detector: four ordered strategies, first match
//! wins unless `--exhaustive` asks every strategy to run and disagreements
//! to be reported.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::bytes::Regex;

use anyhow::Error;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub release_flags: String,
    pub build_metadata: Option<String>,
}

impl Version {
    /// Strategy 1: scan a byte buffer (binary's rodata, or a BSS-resident
    /// banner) for a `sys.version`-shaped string.
    pub fn scan_bytes(data: &[u8]) -> Result<Version, Error> {
        lazy_static! {
            static ref RE: Regex = Regex::new(
                r"((2|3)\.(3|4|5|6|7|8|9|10|11)\.(\d{1,2}))((a|b|c|rc)\d{1,2})?(\+(?:[0-9a-z-]+(?:[.][0-9a-z-]+)*)?)? (.{1,64})"
            )
            .unwrap();
        }

        if let Some(cap) = RE.captures_iter(data).next() {
            let release = match cap.get(5) {
                Some(x) => std::str::from_utf8(x.as_bytes())?,
                None => "",
            };
            let major = std::str::from_utf8(&cap[2])?.parse::<u64>()?;
            let minor = std::str::from_utf8(&cap[3])?.parse::<u64>()?;
            let patch = std::str::from_utf8(&cap[4])?.parse::<u64>()?;
            let build_metadata = if let Some(s) = cap.get(7) {
                Some(std::str::from_utf8(&s.as_bytes()[1..])?.to_owned())
            } else {
                None
            };

            let version = std::str::from_utf8(&cap[0])?;
            info!("Found matching version string '{}'", version);

            return Ok(Version {
                major,
                minor,
                patch,
                release_flags: release.to_owned(),
                build_metadata,
            });
        }
        Err(format_err!("failed to find version string"))
    }

    /// Strategy 2: the libpython shared object's own filename often carries
    /// the version (`libpython3.10.so.1.0`).
    pub fn from_libpython_path(path: &Path) -> Option<Version> {
        lazy_static! {
            static ref RE: regex::Regex =
                regex::Regex::new(r"libpython(\d+)\.(\d+)").unwrap();
        }
        let name = path.file_name()?.to_string_lossy();
        let cap = RE.captures(&name)?;
        Some(Version {
            major: cap[1].parse().ok()?,
            minor: cap[2].parse().ok()?,
            patch: 0,
            release_flags: String::new(),
            build_metadata: None,
        })
    }

    /// Strategy 3: the main binary's own filename, for statically linked
    /// interpreters (`python3.10`, `python3`).
    pub fn from_binary_path(path: &Path) -> Option<Version> {
        lazy_static! {
            static ref RE: regex::Regex = regex::Regex::new(r"python(\d+)(?:\.(\d+))?$").unwrap();
        }
        let name = path.file_name()?.to_string_lossy();
        let cap = RE.captures(&name)?;
        Some(Version {
            major: cap[1].parse().ok()?,
            minor: cap.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
            patch: 0,
            release_flags: String::new(),
            build_metadata: None,
        })
    }

    /// Strategy 4, live targets only: run `<binary> --version` with a 5s
    /// timeout and parse its stdout/stderr. A background thread plus a
    /// channel receive-with-timeout keeps this out of an async runtime,
    /// same spirit as the rest of this crate's concurrency.
    pub fn from_subprocess_version(binary: &Path) -> Option<Version> {
        let binary = binary.to_path_buf();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let output = Command::new(&binary)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output();
            let _ = tx.send(output);
        });
        let output = rx.recv_timeout(Duration::from_secs(5)).ok()?.ok()?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Version::scan_bytes(&combined).ok()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}{}",
            self.major, self.minor, self.patch, self.release_flags
        )?;
        if let Some(build_metadata) = &self.build_metadata {
            write!(f, "+{}", build_metadata,)?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_find_version() {
        let version = Version::scan_bytes(b"2.7.10 (default, Oct  6 2017, 22:29:07)").unwrap();
        assert_eq!(
            version,
            Version {
                major: 2,
                minor: 7,
                patch: 10,
                release_flags: "".to_owned(),
                build_metadata: None,
            }
        );

        let version = Version::scan_bytes(
            b"3.6.3 |Anaconda custom (64-bit)| (default, Oct  6 2017, 12:04:38)",
        )
        .unwrap();
        assert_eq!(version.major, 3);
        assert_eq!(version.minor, 6);
        assert_eq!(version.patch, 3);

        let version =
            Version::scan_bytes(b"Python 3.10.0rc1 (tags/v3.10.0rc1, Aug 28 2021, 18:25:40)")
                .unwrap();
        assert_eq!(version.release_flags, "rc1");

        let version =
            Version::scan_bytes(b"1.7.0rc1 (v1.7.0rc1:dfad352267, Jul 20 2018, 13:27:54)");
        assert!(version.is_err(), "don't match unsupported major version");

        let version = Version::scan_bytes(b"2.7.15+ (default, Oct  2 2018, 22:12:08)").unwrap();
        assert_eq!(version.build_metadata, Some("".to_owned()));
    }

    #[test]
    fn test_from_libpython_path() {
        let v = Version::from_libpython_path(Path::new("/usr/lib/libpython3.10.so.1.0")).unwrap();
        assert_eq!((v.major, v.minor), (3, 10));
        assert!(Version::from_libpython_path(Path::new("/usr/lib/libc.so.6")).is_none());
    }

    #[test]
    fn test_from_binary_path() {
        let v = Version::from_binary_path(Path::new("/usr/bin/python3.11")).unwrap();
        assert_eq!((v.major, v.minor), (3, 11));
        let v = Version::from_binary_path(Path::new("/usr/bin/python3")).unwrap();
        assert_eq!((v.major, v.minor), (3, 0));
    }
}
