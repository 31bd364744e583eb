//! The certificate pseudo-slot and its one-shot background scan.
//!
//! The scan state is a single atomic tri-state. Exactly one initializer
//! wins the compare-and-swap to `Initializing` and runs the scan; it
//! publishes the object list first and flips the state to `Initialized`
//! with a release store, so any reader that observes `Initialized` with an
//! acquire load also observes the list.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::host::{CertificateInfo, CertificateRecord, HostKeystore};
use crate::object::{build_certificate_objects, Object};

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

pub struct CertSlot {
    enabled: bool,
    status: AtomicU8,
    objects: Mutex<Arc<Vec<Object>>>,
}

impl CertSlot {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            status: AtomicU8::new(UNINITIALIZED),
            objects: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn initialized(&self) -> bool {
        self.status.load(Ordering::Acquire) == INITIALIZED
    }

    /// Claim the scan. Only the caller that wins the transition from
    /// uninitialized to initializing may run it.
    pub fn try_begin_scan(&self) -> bool {
        self.status
            .compare_exchange(UNINITIALIZED, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Commit the scanned object list and mark the slot initialized.
    pub fn publish(&self, objects: Vec<Object>) {
        *self.objects.lock() = Arc::new(objects);
        self.status.store(INITIALIZED, Ordering::Release);
    }

    /// Snapshot of the published object list; empty before publication.
    pub fn objects(&self) -> Arc<Vec<Object>> {
        Arc::clone(&self.objects.lock())
    }
}

struct Candidate {
    record: CertificateRecord,
    info: CertificateInfo,
}

/// Select the certificates to export through the certificate slot.
///
/// Every trusted certificate whose common name contains one of the match
/// substrings is exported, together with the transitive set of
/// certificates it issued. Certificates living on hardware tokens are
/// never exported, and duplicates (by public-key hash) are dropped.
pub fn scan_certificates(
    keystore: &dyn HostKeystore,
    match_list: &[String],
) -> Vec<CertificateRecord> {
    if match_list.is_empty() {
        debug!("certificate import disabled, skipping scan");
        return Vec::new();
    }

    let all = match keystore.trusted_certificates() {
        Ok(all) => all,
        Err(err) => {
            warn!(%err, "trusted-certificate query failed");
            return Vec::new();
        }
    };
    debug!(count = all.len(), "searching trusted certificates");

    // The working set; entries are taken out as they are consumed so the
    // issuer chase never revisits a certificate.
    let mut working: Vec<Option<Candidate>> = all
        .into_iter()
        .filter_map(|record| match keystore.certificate_info(&record.der) {
            Ok(info) => Some(Some(Candidate { record, info })),
            Err(err) => {
                warn!(%err, "trusted certificate unparseable, skipping");
                None
            }
        })
        .collect();

    let matched: Vec<usize> = working
        .iter()
        .enumerate()
        .filter(|(_, slot)| {
            slot.as_ref().is_some_and(|candidate| {
                candidate.info.common_name.as_deref().is_some_and(|cn| {
                    match_list.iter().any(|needle| cn.contains(needle.as_str()))
                })
            })
        })
        .map(|(index, _)| index)
        .collect();

    let mut exported = Vec::new();
    for index in matched {
        add_certificate(index, &mut working, &mut exported);
    }

    debug!(count = exported.len(), "certificates added");
    exported
}

fn add_certificate(
    index: usize,
    working: &mut Vec<Option<Candidate>>,
    exported: &mut Vec<CertificateRecord>,
) {
    let Some(candidate) = working[index].take() else {
        return;
    };

    if candidate.record.on_hardware_token {
        debug!("certificate is on a hardware token, skipping");
        return;
    }
    if exported
        .iter()
        .any(|record| record.public_key_hash == candidate.record.public_key_hash)
    {
        debug!("certificate is already in the list, skipping");
        return;
    }

    exported.push(candidate.record);

    // Chase everything this certificate issued.
    let subject = candidate.info.subject;
    let issued: Vec<usize> = working
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.as_ref().is_some_and(|c| c.info.issuer == subject))
        .map(|(i, _)| i)
        .collect();
    for issued_index in issued {
        add_certificate(issued_index, working, exported);
    }
}

/// Run the scan and publish the resulting object list. Called from the
/// background task spawned at initialize time.
pub fn run_scan(keystore: &dyn HostKeystore, match_list: &[String], slot: &CertSlot) {
    let records = scan_certificates(keystore, match_list);
    let objects = build_certificate_objects(keystore, &records);
    slot.publish(objects);
}
