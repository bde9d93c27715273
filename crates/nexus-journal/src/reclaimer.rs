//! Reclaimable file detection.
//!
//! A data file can be recycled when every positive it holds is cancelled by
//! negatives written anywhere in the scanned files, and it holds no negative
//! against an older file that must be kept (dropping such a file would
//! resurrect the record its negative deletes on the next load).
//!
//! Deletes always follow their adds, so a journal only ever records
//! negatives against files with an id lower than or equal to the writer's.
//! Negatives against newer files only count towards the target's balance.
//!
//! The second rule makes eligibility depend on other files, so the scan
//! starts from every balanced file and withdraws candidates until nothing
//! changes. The result does not depend on the order of `files`.

use std::sync::Arc;

use tracing::trace;

use crate::journal_file::JournalFile;

/// Marks every file in `files` with `set_can_reclaim`.
pub fn scan(files: &[Arc<JournalFile>]) {
    let mut can_reclaim: Vec<bool> = files
        .iter()
        .map(|file| {
            let total_neg: u64 = files
                .iter()
                .map(|other| u64::from(other.neg_count(file)))
                .sum();
            u64::from(file.pos_count()) <= total_neg
        })
        .collect();

    loop {
        let mut changed = false;
        for (i, file) in files.iter().enumerate() {
            if !can_reclaim[i] {
                continue;
            }
            let blocked = files.iter().enumerate().any(|(j, older)| {
                !can_reclaim[j] && older.file_id() < file.file_id() && file.neg_count(older) != 0
            });
            if blocked {
                trace!(file = %file, "reclaim blocked by negatives against a live file");
                can_reclaim[i] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for (file, can) in files.iter().zip(can_reclaim) {
        file.set_can_reclaim(can);
    }
}
