//! JSON-lines incident log
//!
//! One terminal incident per line, appended under a `tokio::sync::Mutex` and
//! synced after every record. A failed append is cut back off the file so a
//! retry never leaves two copies or a fragment glued to the next line.

use crate::error::LedgerError;
use crate::incidents::Incident;
use crate::ledger::store::{IncidentStore, LedgerQuery, StoreFuture};
use log::{debug, error, warn};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

struct LogFile {
    file: File,
    /// The file ends in an unterminated fragment the next record must not
    /// continue
    torn: bool,
}

pub struct JsonlStore {
    path: PathBuf,
    writer: Mutex<LogFile>,
    #[cfg(test)]
    fail_next_syncs: AtomicU32,
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

async fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path).await?;
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

impl JsonlStore {
    /// Open (or create) the log at `path` in append mode
    pub async fn open(path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let torn = ends_mid_line(&path).await?;
        if torn {
            warn!(
                "Ledger {} ends in an incomplete record, starting a new line",
                path.display()
            );
        }
        debug!("Incident ledger opened at {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(LogFile { file, torn }),
            #[cfg(test)]
            fail_next_syncs: AtomicU32::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Report the next `count` appends as failed after their data is synced
    #[cfg(test)]
    fn fail_next_syncs(&self, count: u32) {
        self.fail_next_syncs.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> std::io::Result<()> {
        let remaining = self.fail_next_syncs.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        self.fail_next_syncs.store(remaining - 1, Ordering::SeqCst);
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected sync failure",
        ))
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl IncidentStore for JsonlStore {
    fn append<'a>(&'a self, incident: &'a Incident) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut line = serde_json::to_string(incident)?;
            line.push('\n');

            let mut log = self.writer.lock().await;
            if log.torn {
                line.insert(0, '\n');
            }
            let start = log
                .file
                .metadata()
                .await
                .map_err(|e| LedgerError::WriteFailed(format!("{}: {}", self.path.display(), e)))?
                .len();

            let written = write_line(&mut log.file, line.as_bytes())
                .await
                .and_then(|()| self.injected_failure());
            if let Err(e) = written {
                // Whatever part of the line reached the file comes off again.
                let rollback = match log.file.set_len(start).await {
                    Ok(()) => log.file.sync_data().await,
                    Err(rollback_error) => Err(rollback_error),
                };
                if let Err(rollback_error) = rollback {
                    error!(
                        "Could not roll back partial ledger write in {}: {}",
                        self.path.display(),
                        rollback_error
                    );
                    log.torn = true;
                }
                return Err(LedgerError::WriteFailed(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )));
            }

            log.torn = false;
            Ok(())
        })
    }

    fn query<'a>(&'a self, filter: &'a LedgerQuery) -> StoreFuture<'a, Vec<Incident>> {
        Box::pin(async move {
            // Holding the writer lock keeps a half-written line out of the read.
            let _writer = self.writer.lock().await;
            let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                LedgerError::QueryFailed(format!("{}: {}", self.path.display(), e))
            })?;

            let mut incidents = Vec::new();
            let mut seen = HashSet::new();
            for (index, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Incident>(line) {
                    Ok(incident) if !seen.insert(incident.id) => warn!(
                        "Skipping repeated record of incident {} on ledger line {}",
                        incident.id,
                        index + 1
                    ),
                    Ok(incident) if filter.matches(&incident) => incidents.push(incident),
                    Ok(_) => {}
                    Err(e) => warn!(
                        "Skipping malformed ledger line {} in {}: {}",
                        index + 1,
                        self.path.display(),
                        e
                    ),
                }
            }

            Ok(incidents)
        })
    }
}
