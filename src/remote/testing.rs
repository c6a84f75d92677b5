//! In-memory remote host for tests.
//!
//! Implements the transport seam over a path -> file map. The two shell
//! command lines the crate issues (`stat ... | grep Modify > out` and
//! `gzip -c src > out`) are interpreted; anything else exits 127. A [`Gate`]
//! parks a connect or read until the test lets it through.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use chrono::DateTime;
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::{Mutex, MutexGuard};

use super::transport::{
    ConnectError, ExecOutput, RemoteDirEntry, RemoteTransport, TransportConnector, TransportError,
};
use crate::config::ConnectionConfig;

/// Two-step rendezvous between a fake call and the test driving it.
#[derive(Debug, Clone)]
pub(crate) struct Gate {
    entered: Arc<Barrier>,
    released: Arc<Barrier>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Barrier::new(2)),
            released: Arc::new(Barrier::new(2)),
        }
    }

    /// Resolves once the gated call is parked.
    pub async fn wait_entered(&self) {
        wait_on(Arc::clone(&self.entered)).await;
    }

    /// Lets the parked call continue.
    pub async fn release(&self) {
        wait_on(Arc::clone(&self.released)).await;
    }

    fn pass(&self) {
        self.entered.wait();
        self.released.wait();
    }
}

async fn wait_on(barrier: Arc<Barrier>) {
    tokio::task::spawn_blocking(move || {
        barrier.wait();
    })
    .await
    .unwrap();
}

#[derive(Debug, Clone)]
pub(crate) struct FakeFile {
    pub data: Vec<u8>,
    pub mtime: i64,
}

#[derive(Debug)]
pub(crate) struct FakeState {
    pub files: HashMap<String, FakeFile>,
    pub home: String,
    pub native_stat_unsupported: bool,
    /// Number of upcoming reads that fail with a transport error.
    pub fail_reads: usize,
    /// Number of upcoming connects that are refused.
    pub fail_connects: usize,
    /// Commands containing this text exit 1.
    pub fail_exec_matching: Option<String>,
    pub fail_transfer: bool,
    /// Removals are refused with an SFTP status.
    pub fail_remove: bool,
    /// Every call on an open transport fails as if the socket died.
    pub link_dead: bool,
    /// Parks the next connect inside `open`.
    pub open_gate: Option<Gate>,
    /// Parks the next `read_file`.
    pub read_gate: Option<Gate>,
    pub opens: Vec<ConnectionConfig>,
    pub closes: usize,
    pub native_stats: usize,
    pub reads: Vec<String>,
    pub execs: Vec<String>,
    pub transfers: Vec<String>,
    pub removed: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            files: HashMap::new(),
            home: "/home/dev".to_string(),
            native_stat_unsupported: false,
            fail_reads: 0,
            fail_connects: 0,
            fail_exec_matching: None,
            fail_transfer: false,
            fail_remove: false,
            link_dead: false,
            open_gate: None,
            read_gate: None,
            opens: Vec::new(),
            closes: 0,
            native_stats: 0,
            reads: Vec::new(),
            execs: Vec::new(),
            transfers: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl FakeState {
    fn check_link(&self) -> Result<(), TransportError> {
        if self.link_dead {
            return Err(TransportError::Io("connection reset by peer".to_string()));
        }
        Ok(())
    }

    pub fn reads_of(&self, path: &str) -> usize {
        self.reads.iter().filter(|p| *p == path).count()
    }

    /// Paths under the home directory that the crate created as scratch files.
    pub fn scratch_files(&self) -> Vec<String> {
        let prefix = format!("{}/.ctagssh.temp.", self.home);
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn exec(&mut self, command: &str) -> ExecOutput {
        self.execs.push(command.to_string());
        if let Some(needle) = &self.fail_exec_matching
            && command.contains(needle.as_str())
        {
            return failed(1, "injected failure");
        }
        let Ok(words) = shell_words::split(command) else {
            return failed(2, "syntax error");
        };
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["stat", path, "|", "grep", "Modify", ">", out] => {
                let Some(file) = self.files.get(*path) else {
                    return failed(1, "stat: cannot stat");
                };
                let Some(stamp) = DateTime::from_timestamp(file.mtime, 0) else {
                    return failed(1, "stat: bad time");
                };
                let line = format!("Modify: {} +0000\n", stamp.format("%Y-%m-%d %H:%M:%S%.9f"));
                self.put(out, line.into_bytes(), 0);
                ExecOutput::default()
            }
            ["gzip", "-c", source, ">", out] => {
                let Some(file) = self.files.get(*source) else {
                    return failed(1, "gzip: No such file or directory");
                };
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                let compressed = encoder
                    .write_all(&file.data)
                    .and_then(|_| encoder.finish());
                match compressed {
                    Ok(bytes) => {
                        self.put(out, bytes, 0);
                        ExecOutput::default()
                    }
                    Err(e) => failed(1, &e.to_string()),
                }
            }
            [program, ..] => failed(127, &format!("{}: command not found", program)),
            [] => ExecOutput::default(),
        }
    }

    fn put(&mut self, path: &str, data: Vec<u8>, mtime: i64) {
        self.files
            .insert(path.to_string(), FakeFile { data, mtime });
    }
}

fn failed(exit_status: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_status,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Shared handle to the fake host; every transport it opens sees the same files.
#[derive(Clone, Default)]
pub(crate) struct FakeRemote(Arc<Mutex<FakeState>>);

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn TransportConnector> {
        Arc::new(self.clone())
    }

    pub fn put(&self, path: &str, content: impl Into<Vec<u8>>, mtime: i64) {
        self.0.lock().put(path, content.into(), mtime);
    }

    pub fn touch(&self, path: &str, mtime: i64) {
        if let Some(file) = self.0.lock().files.get_mut(path) {
            file.mtime = mtime;
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock()
    }
}

impl TransportConnector for FakeRemote {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteTransport>, ConnectError> {
        let gate = {
            let mut state = self.0.lock();
            state.opens.push(config.clone());
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(ConnectError::Transport {
                    host: config.host.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            state.open_gate.take()
        };
        if let Some(gate) = gate {
            gate.pass();
        }
        Ok(Box::new(FakeTransport(Arc::clone(&self.0))))
    }
}

struct FakeTransport(Arc<Mutex<FakeState>>);

impl RemoteTransport for FakeTransport {
    fn home_dir(&mut self) -> Result<String, TransportError> {
        Ok(self.0.lock().home.clone())
    }

    fn stat_mtime(&mut self, path: &str) -> Result<i64, TransportError> {
        let mut state = self.0.lock();
        state.check_link()?;
        state.native_stats += 1;
        if state.native_stat_unsupported {
            return Err(TransportError::Unsupported(path.to_string()));
        }
        state
            .files
            .get(path)
            .map(|f| f.mtime)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let gate = self.0.lock().read_gate.take();
        if let Some(gate) = gate {
            gate.pass();
        }
        let mut state = self.0.lock();
        state.check_link()?;
        state.reads.push(path.to_string());
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(TransportError::Io("connection reset by peer".to_string()));
        }
        state
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
        let state = self.0.lock();
        state.check_link()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut entries = Vec::new();
        let mut dirs = BTreeSet::new();
        for (name, file) in &state.files {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(dir.to_string());
                }
                None => entries.push(RemoteDirEntry {
                    filename: rest.to_string(),
                    is_file: true,
                    size: file.data.len() as u64,
                    mtime: file.mtime,
                }),
            }
        }
        entries.extend(dirs.into_iter().map(|filename| RemoteDirEntry {
            filename,
            is_file: false,
            size: 0,
            mtime: 0,
        }));
        if entries.is_empty() {
            return Err(TransportError::NotFound(path.to_string()));
        }
        Ok(entries)
    }

    fn exec(&mut self, command: &str, _timeout: Duration) -> Result<ExecOutput, TransportError> {
        let mut state = self.0.lock();
        state.check_link()?;
        Ok(state.exec(command))
    }

    fn fast_get(
        &mut self,
        remote: &str,
        local: &Path,
        _timeout: Duration,
    ) -> Result<u64, TransportError> {
        let mut state = self.0.lock();
        state.check_link()?;
        state.transfers.push(remote.to_string());
        if state.fail_transfer {
            return Err(TransportError::Io("channel closed".to_string()));
        }
        let data = state
            .files
            .get(remote)
            .map(|f| f.data.clone())
            .ok_or_else(|| TransportError::NotFound(remote.to_string()))?;
        drop(state);
        std::fs::write(local, &data).map_err(|e| TransportError::Local(e.to_string()))?;
        Ok(data.len() as u64)
    }

    fn remove_file(&mut self, path: &str) -> Result<(), TransportError> {
        let mut state = self.0.lock();
        state.check_link()?;
        if state.fail_remove {
            return Err(TransportError::Refused(format!("{}: permission denied", path)));
        }
        state
            .files
            .remove(path)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))?;
        state.removed.push(path.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.0.lock().closes += 1;
        Ok(())
    }
}
