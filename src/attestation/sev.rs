//! AMD SEV-SNP quote provider
//!
//! Quotes are requested through the Linux TSM (Trusted Security Module)
//! configfs interface under `/sys/kernel/config/tsm/report/`:
//! 1. Create a report entry directory
//! 2. Check the entry is backed by the `sev_guest` provider
//! 3. Write the 64-byte user data to `inblob`
//! 4. Read the signed report from `outblob`
//! 5. Check the `generation` counter moved exactly once (no concurrent writer)
//! 6. Remove the entry

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fs_err as fs;
use tracing::{debug, warn};

use super::types::{PredicateType, UserData, USER_DATA_SIZE};
use super::AttestationProvider;
use crate::error::{Error, Result};

// SEV-SNP report offsets (v2/v3 report structure)
pub const REPORT_DATA_OFFSET: usize = 80;
pub const REPORT_SIZE: usize = 1184;

const TSM_REPORT_ROOT: &str = "/sys/kernel/config/tsm/report";
const SEV_GUEST_PROVIDER: &str = "sev_guest";

// outblob may carry provider padding past REPORT_SIZE
const OUTBLOB_BUF_SIZE: usize = 8 * 1024;
const MAX_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Extract the 64-byte user-data field from a raw SEV-SNP report
pub fn report_data(report: &[u8]) -> Option<&[u8]> {
    report.get(REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + USER_DATA_SIZE)
}

/// SEV-SNP quote provider backed by configfs-tsm
#[derive(Debug, Clone)]
pub struct SevGuestProvider {
    root: PathBuf,
}

impl Default for SevGuestProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SevGuestProvider {
    pub fn new() -> Self {
        Self::with_root(TSM_REPORT_ROOT)
    }

    /// Use a different configfs report root
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AttestationProvider for SevGuestProvider {
    fn format(&self) -> PredicateType {
        PredicateType::SevGuestV1
    }

    fn max_report_size(&self) -> usize {
        REPORT_SIZE
    }

    fn get_quote(&self, user_data: &UserData) -> Result<Vec<u8>> {
        if !self.root.is_dir() {
            return Err(Error::ProviderUnavailable(format!(
                "TSM configfs not found at {}. Is TSM_REPORT enabled in kernel?",
                self.root.display()
            )));
        }

        let entry = ReportEntry::create(&self.root)?;

        let provider = entry.read_attr("provider")?;
        if provider.trim() != SEV_GUEST_PROVIDER {
            return Err(Error::ProviderUnavailable(format!(
                "TSM provider is {:?}, expected {}",
                provider.trim(),
                SEV_GUEST_PROVIDER
            )));
        }

        let gen1 = entry.generation()?;
        entry.write_inblob(user_data)?;
        let report = entry.read_outblob()?;
        let gen2 = entry.generation()?;

        if gen2 != gen1 + 1 {
            return Err(Error::QuoteFailure(format!(
                "concurrent quote generation detected: gen1={gen1}, gen2={gen2}"
            )));
        }

        if report.len() < REPORT_SIZE {
            return Err(Error::QuoteFailure(format!(
                "report too small: got {} bytes, expected {}",
                report.len(),
                REPORT_SIZE
            )));
        }

        if report_data(&report) != Some(user_data.as_bytes().as_slice()) {
            return Err(Error::QuoteFailure(
                "report user data does not match request".into(),
            ));
        }

        debug!(len = report.len(), "received SEV-SNP report");
        Ok(report)
    }
}

/// A configfs report entry, removed on drop
struct ReportEntry {
    path: PathBuf,
}

impl ReportEntry {
    fn create(root: &Path) -> Result<Self> {
        let name = format!(
            "tinfoil-shim-{}-{}",
            std::process::id(),
            ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = root.join(name);
        fs::create_dir(&path).map_err(|e| {
            Error::ProviderUnavailable(format!("failed to create report entry: {e}"))
        })?;
        Ok(Self { path })
    }

    fn read_attr(&self, attr: &str) -> Result<String> {
        fs::read_to_string(self.path.join(attr))
            .map_err(|e| Error::QuoteFailure(format!("failed to read {attr}: {e}")))
    }

    fn generation(&self) -> Result<u64> {
        parse_generation(&self.read_attr("generation")?)
    }

    fn write_inblob(&self, user_data: &UserData) -> Result<()> {
        let inblob = self.path.join("inblob");
        let mut last_err = None;
        for retry in 0..MAX_RETRIES {
            match fs::write(&inblob, user_data.as_bytes()) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if retry < MAX_RETRIES - 1 {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
        Err(Error::QuoteFailure(format!(
            "failed to write inblob after {MAX_RETRIES} retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn read_outblob(&self) -> Result<Vec<u8>> {
        let outblob = self.path.join("outblob");
        let mut last_err = None;
        for retry in 0..MAX_RETRIES {
            let attempt = fs::File::open(&outblob).and_then(|file| {
                let mut report = Vec::with_capacity(REPORT_SIZE);
                file.take(OUTBLOB_BUF_SIZE as u64).read_to_end(&mut report)?;
                Ok(report)
            });
            match attempt {
                Ok(report) if !report.is_empty() => return Ok(report),
                Ok(_) => return Err(Error::QuoteFailure("empty report from configfs".into())),
                Err(e) => {
                    last_err = Some(e);
                    if retry < MAX_RETRIES - 1 {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
        Err(Error::QuoteFailure(format!(
            "failed to read outblob after {MAX_RETRIES} retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

impl Drop for ReportEntry {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("failed to remove report entry: {}", e);
        }
    }
}

fn parse_generation(s: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|e| Error::QuoteFailure(format!("failed to parse generation {s:?}: {e}")))
}
