use super::{FOLLOW_BUFFER, JournalError, JournalProvider, LiveStream, LogQuery};
use crate::systemd::logs::{
    ENTRY_FIELDS, FIELD_CURSOR, FIELD_REALTIME, FIELD_UNIT, JournalRecord, LogEntry, ParseSkipped,
    normalize,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

#[link(name = "systemd")]
unsafe extern "C" {
    fn sd_journal_open(ret: *mut *mut c_void, flags: c_int) -> c_int;
    fn sd_journal_open_directory(ret: *mut *mut c_void, path: *const c_char, flags: c_int)
    -> c_int;
    fn sd_journal_close(j: *mut c_void);
    fn sd_journal_add_match(j: *mut c_void, data: *const c_void, size: usize) -> c_int;
    fn sd_journal_seek_tail(j: *mut c_void) -> c_int;
    fn sd_journal_previous(j: *mut c_void) -> c_int;
    fn sd_journal_next(j: *mut c_void) -> c_int;
    fn sd_journal_wait(j: *mut c_void, timeout_usec: u64) -> c_int;
    fn sd_journal_get_realtime_usec(j: *mut c_void, ret: *mut u64) -> c_int;
    fn sd_journal_get_cursor(j: *mut c_void, cursor: *mut *mut c_char) -> c_int;
    fn sd_journal_get_data(
        j: *mut c_void,
        field: *const c_char,
        data: *mut *const u8,
        length: *mut usize,
    ) -> c_int;
}

const SD_JOURNAL_LOCAL_ONLY: c_int = 1;

/// How long a follow thread sleeps in `sd_journal_wait` before checking for a gone client
const FOLLOW_POLL_USEC: u64 = 250_000;

/// Reads the journal files directly through libsystemd
pub struct NativeProvider {
    directory: Option<PathBuf>,
}

impl NativeProvider {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl JournalProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn fetch_recent(&self, query: &LogQuery) -> Result<Vec<LogEntry>, JournalError> {
        let directory = self.directory.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || {
            let journal = RawJournal::open(directory.as_deref(), query.unit.as_deref())?;
            journal.read_recent(query.limit)
        })
        .await
        .map_err(|_| JournalError::ReaderGone)?
    }

    async fn open_live_stream(&self, unit: Option<&str>) -> Result<LiveStream, JournalError> {
        let directory = self.directory.clone();
        let unit = unit.map(str::to_string);
        let (tx, rx) = mpsc::channel(FOLLOW_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("journal-follow".to_string())
            .spawn(move || follow(directory, unit, tx, ready_tx))
            .map_err(|source| JournalError::Spawn {
                program: "journal-follow thread".to_string(),
                source,
            })?;

        ready_rx.await.map_err(|_| JournalError::ReaderGone)??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Body of a follow thread; owns the journal handle for its whole life
fn follow(
    directory: Option<PathBuf>,
    unit: Option<String>,
    tx: mpsc::Sender<LogEntry>,
    ready: oneshot::Sender<Result<(), JournalError>>,
) {
    let journal = match RawJournal::open(directory.as_deref(), unit.as_deref())
        .and_then(|j| j.seek_to_end().map(|_| j))
    {
        Ok(journal) => journal,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let mut skipped = 0usize;
    while !tx.is_closed() {
        match journal.next() {
            Ok(true) => match journal.read_entry() {
                Ok(entry) => {
                    if tx.blocking_send(entry).is_err() {
                        break;
                    }
                }
                Err(_) => skipped += 1,
            },
            Ok(false) => {
                if let Err(e) = journal.wait(FOLLOW_POLL_USEC) {
                    tracing::warn!("journal wait failed, ending follow: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("journal read failed, ending follow: {}", e);
                break;
            }
        }
    }

    tracing::debug!(
        unit = unit.as_deref().unwrap_or("*"),
        skipped,
        "journal follow thread finished"
    );
}

/// Owned `sd_journal` handle, closed on drop.
///
/// sd-journal handles are bound to the thread that uses them; the raw pointer
/// keeps this type `!Send`.
struct RawJournal {
    j: *mut c_void,
}

impl RawJournal {
    fn open(directory: Option<&Path>, unit: Option<&str>) -> Result<Self, JournalError> {
        let mut j: *mut c_void = std::ptr::null_mut();
        let rc = match directory {
            Some(dir) => {
                let path = CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
                    JournalError::Native {
                        call: "sd_journal_open_directory",
                        errno: libc::EINVAL,
                    }
                })?;
                unsafe { sd_journal_open_directory(&mut j, path.as_ptr(), 0) }
            }
            None => unsafe { sd_journal_open(&mut j, SD_JOURNAL_LOCAL_ONLY) },
        };
        check("sd_journal_open", rc)?;
        if j.is_null() {
            return Err(JournalError::Native {
                call: "sd_journal_open",
                errno: libc::ENOENT,
            });
        }
        let journal = Self { j };

        if let Some(u) = unit {
            let m = format!("{}={}", FIELD_UNIT, u);
            let rc = unsafe { sd_journal_add_match(journal.j, m.as_ptr() as *const c_void, m.len()) };
            check("sd_journal_add_match", rc)?;
        }

        Ok(journal)
    }

    /// Walk back from the tail; returns oldest first
    fn read_recent(&self, max: usize) -> Result<Vec<LogEntry>, JournalError> {
        check("sd_journal_seek_tail", unsafe { sd_journal_seek_tail(self.j) })?;

        let mut out = Vec::with_capacity(max.min(1024));
        let mut skipped = 0usize;
        while out.len() < max {
            let rc = unsafe { sd_journal_previous(self.j) };
            if check("sd_journal_previous", rc)? == 0 {
                break;
            }
            match self.read_entry() {
                Ok(e) => out.push(e),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, "skipped unreadable journal entries");
        }

        out.reverse();
        Ok(out)
    }

    /// Position on the newest entry so that `next` only yields new ones
    fn seek_to_end(&self) -> Result<(), JournalError> {
        check("sd_journal_seek_tail", unsafe { sd_journal_seek_tail(self.j) })?;
        check("sd_journal_previous", unsafe { sd_journal_previous(self.j) })?;
        Ok(())
    }

    fn next(&self) -> Result<bool, JournalError> {
        Ok(check("sd_journal_next", unsafe { sd_journal_next(self.j) })? > 0)
    }

    fn wait(&self, timeout_usec: u64) -> Result<(), JournalError> {
        check("sd_journal_wait", unsafe { sd_journal_wait(self.j, timeout_usec) })?;
        Ok(())
    }

    fn read_entry(&self) -> Result<LogEntry, ParseSkipped> {
        let mut record = JournalRecord::new();
        if let Some(ts) = self.realtime_usec() {
            record.insert(FIELD_REALTIME, ts.to_string());
        }
        if let Some(cursor) = self.cursor() {
            record.insert(FIELD_CURSOR, cursor);
        }
        for field in ENTRY_FIELDS {
            if let Some(value) = self.field(field) {
                record.insert(field, value);
            }
        }
        normalize(&record)
    }

    fn realtime_usec(&self) -> Option<u64> {
        let mut ts = 0u64;
        let rc = unsafe { sd_journal_get_realtime_usec(self.j, &mut ts as *mut u64) };
        if rc >= 0 { Some(ts) } else { None }
    }

    fn cursor(&self) -> Option<String> {
        let mut raw: *mut c_char = std::ptr::null_mut();
        let rc = unsafe { sd_journal_get_cursor(self.j, &mut raw) };
        if rc < 0 || raw.is_null() {
            return None;
        }
        let cursor = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { libc::free(raw as *mut c_void) };
        Some(cursor)
    }

    fn field(&self, field: &str) -> Option<String> {
        let field_c = CString::new(field).ok()?;
        let mut data_ptr: *const u8 = std::ptr::null();
        let mut len: usize = 0;
        let rc = unsafe {
            sd_journal_get_data(
                self.j,
                field_c.as_ptr(),
                &mut data_ptr as *mut *const u8,
                &mut len as *mut usize,
            )
        };
        if rc < 0 || data_ptr.is_null() || len == 0 {
            return None;
        }

        let bytes = unsafe { std::slice::from_raw_parts(data_ptr, len) };
        let text = String::from_utf8_lossy(bytes);
        let prefix = format!("{}=", field);
        text.strip_prefix(&prefix).map(|s| s.to_string())
    }
}

impl Drop for RawJournal {
    fn drop(&mut self) {
        unsafe { sd_journal_close(self.j) };
    }
}

fn check(call: &'static str, rc: c_int) -> Result<c_int, JournalError> {
    if rc < 0 {
        Err(JournalError::Native { call, errno: -rc })
    } else {
        Ok(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Threads of this process currently named `journal-follow`
    fn follow_threads() -> usize {
        std::fs::read_dir("/proc/self/task")
            .unwrap()
            .filter_map(|task| std::fs::read_to_string(task.ok()?.path().join("comm")).ok())
            .filter(|comm| comm.trim() == "journal-follow")
            .count()
    }

    #[tokio::test]
    async fn empty_directory_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NativeProvider::new(Some(dir.path().to_path_buf()));

        let query = LogQuery {
            unit: Some("cron.service".to_string()),
            limit: 10,
        };
        assert_eq!(provider.fetch_recent(&query).await.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn follow_threads_end_after_streams_drop() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NativeProvider::new(Some(dir.path().to_path_buf()));

        for _ in 0..10 {
            let stream = provider.open_live_stream(Some("cron.service")).await.unwrap();
            drop(stream);
        }

        let mut remaining = follow_threads();
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            remaining = follow_threads();
        }
        assert_eq!(remaining, 0, "follow threads outlived their streams");
    }

    #[test]
    fn negative_return_codes_carry_errno() {
        let err = check("sd_journal_next", -libc::EBADMSG).unwrap_err();
        assert!(matches!(
            err,
            JournalError::Native {
                call: "sd_journal_next",
                errno
            } if errno == libc::EBADMSG
        ));
        assert_eq!(check("sd_journal_next", 1).unwrap(), 1);
    }
}
