//! JSON state file behind the store.
//!
//! Writes happen on a dedicated thread fed by a crossbeam channel so the
//! background actor never blocks on disk. Bursts (one write per route tick)
//! collapse to the latest snapshot.

use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::{background::store::StoreData, telemetry::spawn_thread};

/// Read a previously saved store, or the defaults when there is none.
pub(crate) fn load_or_default(path: &Path) -> StoreData {
    match load(path) {
        Ok(Some(data)) => data,
        Ok(None) => StoreData::default(),
        Err(err) => {
            warn!("ignoring unreadable state file {}: {err:#}", path.display());
            StoreData::default()
        }
    }
}

fn load(path: &Path) -> Result<Option<StoreData>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("failed to read state file"),
    };
    let data: StoreData = serde_json::from_str(&raw).context("state file is not valid JSON")?;
    if let Err(err) = data.spoof.validate() {
        warn!("stored spoof state is out of range ({err}); using defaults");
        return Ok(Some(StoreData {
            spoof: Default::default(),
            ..data
        }));
    }
    Ok(Some(data))
}

/// Queue side of the writer thread, owned by the store. Dropping it never
/// blocks; the thread drains what is queued and exits.
pub(crate) struct StateWriter {
    tx: Sender<StoreData>,
}

/// Join side of the writer thread. Held outside the tokio runtime so the
/// final flush is awaited off the worker threads.
pub(crate) struct StateFlush {
    handle: thread::JoinHandle<()>,
}

impl StateWriter {
    pub(crate) fn spawn(path: PathBuf) -> Result<(Self, StateFlush)> {
        let (tx, rx) = crossbeam_channel::unbounded::<StoreData>();
        let handle = spawn_thread("relocate-state-writer", move || write_loop(&path, rx))
            .context("failed to spawn state writer thread")?;
        Ok((Self { tx }, StateFlush { handle }))
    }

    pub(crate) fn save(&self, data: StoreData) {
        if self.tx.send(data).is_err() {
            warn!("state writer thread is gone; snapshot not persisted");
        }
    }
}

impl StateFlush {
    /// Wait for the last queued snapshot to hit the disk. Returns once every
    /// [`StateWriter`] has been dropped.
    pub(crate) fn finish(self) {
        if self.handle.join().is_err() {
            warn!("state writer thread panicked");
        }
    }
}

fn write_loop(path: &Path, rx: Receiver<StoreData>) {
    while let Ok(mut data) = rx.recv() {
        while let Ok(newer) = rx.try_recv() {
            data = newer;
        }
        match write_atomic(path, &data) {
            Ok(()) => debug!("state saved to {}", path.display()),
            Err(err) => warn!("failed to save state to {}: {err:#}", path.display()),
        }
    }
}

fn write_atomic(path: &Path, data: &StoreData) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("failed to create state directory")?;
    }
    let json = serde_json::to_vec_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).context("failed to write temporary state file")?;
    fs::rename(&tmp, path).context("failed to move state file into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use geo_core::SpoofState;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let data = load_or_default(&dir.path().join("absent.json"));
        assert_eq!(data, StoreData::default());
    }

    #[test]
    fn garbage_and_out_of_range_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_or_default(&path), StoreData::default());

        fs::write(&path, r#"{"spoofEnabled":true,"latitude":123.0,"useCount":4}"#).unwrap();
        let data = load_or_default(&path);
        assert_eq!(data.spoof, SpoofState::default());
        assert_eq!(data.use_count, 4);
    }

    #[test]
    fn finish_persists_the_latest_snapshot_once_the_writer_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let (writer, flush) = StateWriter::spawn(path.clone()).unwrap();
        for n in 1..=5 {
            writer.save(StoreData {
                use_count: n,
                ..StoreData::default()
            });
        }
        drop(writer);
        flush.finish();

        let data = load_or_default(&path);
        assert_eq!(data.use_count, 5);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
