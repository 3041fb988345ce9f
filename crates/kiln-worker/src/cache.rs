//! Staged-payload cache: the runner's process-unique program directory.
//!
//! Every load stages its payload under `<prog_dir_root>/kiln-prog-<uuid>/
//! <code_token>/` so respawns never re-fetch bytes from the host. Alias
//! loads hard-link the source entry's files into their own entry
//! directory: deleting the original unlinks only its own names, so the
//! alias keeps a live inode.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_core::messages::{LoadBinary, LoaderKind};
use tracing::warn;
use uuid::Uuid;

/// File name of a staged native binary inside its entry directory.
const BINARY_FILE: &str = "udf";
/// File name of staged JavaScript source.
const JS_FILE: &str = "source.js";
/// File name of a staged wasm module.
const WASM_FILE: &str = "module.wasm";

/// Staging failures, reported in the load ack.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Alias load referenced a token this runner has not staged.
    #[error("unknown source token {0}")]
    UnknownSource(String),

    /// JS or wasm entry arrived but no engine shim is configured.
    #[error("no engine shim configured for loader kind {0:?}")]
    NoEngineShim(LoaderKind),

    /// The load carried no payload for its loader kind.
    #[error("empty payload for loader kind {0:?}")]
    EmptyPayload(LoaderKind),

    /// The wire loader kind was out of range.
    #[error("unknown loader kind {0}")]
    UnknownKind(i32),

    /// Filesystem failure while staging.
    #[error("staging i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// One staged entry: what to exec and what to pass it.
#[derive(Debug, Clone)]
pub struct StagedEntry {
    /// Directory holding the staged files; removed at delete.
    pub entry_dir: PathBuf,
    /// Binary the worker execs: the staged UDF, or the engine shim.
    pub exec_path: PathBuf,
    /// Extra argv after the socket fd (engine kinds get their staged
    /// source/module paths).
    pub args_tail: Vec<OsString>,
    /// Redirect worker stdout/stderr into per-execution log files.
    pub log_egress: bool,
}

/// The runner's program directory and the entries staged in it.
pub struct ProgramDir {
    root: PathBuf,
    entries: HashMap<String, StagedEntry>,
    engine_shim: Option<PathBuf>,
}

impl ProgramDir {
    /// Creates a fresh process-unique program directory under `base`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be created.
    pub fn create(base: &Path, engine_shim: Option<PathBuf>) -> std::io::Result<Self> {
        let root = base.join(format!("kiln-prog-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            entries: HashMap::new(),
            engine_shim,
        })
    }

    /// The directory all workers need bind-mounted.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Looks up a staged entry.
    #[must_use]
    pub fn get(&self, code_token: &str) -> Option<&StagedEntry> {
        self.entries.get(code_token)
    }

    /// Stages the payload of one load request and records it under its
    /// code token.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] on an unknown alias source, missing shim,
    /// empty payload, or filesystem failure.
    pub fn stage(&mut self, load: &LoadBinary) -> Result<&StagedEntry, StageError> {
        let kind = LoaderKind::try_from(load.loader_kind)
            .map_err(|_| StageError::UnknownKind(load.loader_kind))?;
        let entry_dir = self.root.join(&load.code_token);
        std::fs::create_dir_all(&entry_dir)?;

        let staged = if load.source_code_token.is_empty() {
            self.stage_fresh(load, kind, &entry_dir)?
        } else {
            self.stage_alias(&load.source_code_token, load.enable_log_egress, &entry_dir)?
        };
        Ok(self
            .entries
            .entry(load.code_token.clone())
            .or_insert(staged))
    }

    fn stage_fresh(
        &self,
        load: &LoadBinary,
        kind: LoaderKind,
        entry_dir: &Path,
    ) -> Result<StagedEntry, StageError> {
        match kind {
            LoaderKind::NativeBinary => {
                if load.binary_content.is_empty() {
                    return Err(StageError::EmptyPayload(kind));
                }
                let path = entry_dir.join(BINARY_FILE);
                std::fs::write(&path, &load.binary_content)?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o500))?;
                Ok(StagedEntry {
                    entry_dir: entry_dir.to_path_buf(),
                    exec_path: path,
                    args_tail: Vec::new(),
                    log_egress: load.enable_log_egress,
                })
            }
            LoaderKind::Javascript | LoaderKind::JavascriptWithWasm | LoaderKind::WasmOnly => {
                let shim = self
                    .engine_shim
                    .clone()
                    .ok_or(StageError::NoEngineShim(kind))?;
                let mut args_tail = Vec::new();
                if matches!(kind, LoaderKind::Javascript | LoaderKind::JavascriptWithWasm) {
                    if load.js_source.is_empty() {
                        return Err(StageError::EmptyPayload(kind));
                    }
                    let source = entry_dir.join(JS_FILE);
                    std::fs::write(&source, &load.js_source)?;
                    args_tail.push(source.into_os_string());
                }
                if matches!(kind, LoaderKind::JavascriptWithWasm | LoaderKind::WasmOnly) {
                    if load.wasm_blob.is_empty() {
                        return Err(StageError::EmptyPayload(kind));
                    }
                    let wasm = entry_dir.join(WASM_FILE);
                    std::fs::write(&wasm, &load.wasm_blob)?;
                    args_tail.push(wasm.into_os_string());
                }
                Ok(StagedEntry {
                    entry_dir: entry_dir.to_path_buf(),
                    exec_path: shim,
                    args_tail,
                    log_egress: load.enable_log_egress,
                })
            }
        }
    }

    fn stage_alias(
        &self,
        source_token: &str,
        log_egress: bool,
        entry_dir: &Path,
    ) -> Result<StagedEntry, StageError> {
        let source = self
            .entries
            .get(source_token)
            .ok_or_else(|| StageError::UnknownSource(source_token.to_owned()))?;
        let mut exec_path = source.exec_path.clone();
        let mut args_tail = Vec::new();
        // Hard-link every staged file so the alias survives deletion of
        // the original entry directory.
        if source.exec_path.starts_with(&source.entry_dir) {
            let file_name = source
                .exec_path
                .file_name()
                .ok_or_else(|| StageError::Io(std::io::Error::other("staged file has no name")))?;
            let linked = entry_dir.join(file_name);
            std::fs::hard_link(&source.exec_path, &linked)?;
            exec_path = linked;
        }
        for arg in &source.args_tail {
            let path = PathBuf::from(arg);
            if path.starts_with(&source.entry_dir) {
                let file_name = path.file_name().ok_or_else(|| {
                    StageError::Io(std::io::Error::other("staged file has no name"))
                })?;
                let linked = entry_dir.join(file_name);
                std::fs::hard_link(&path, &linked)?;
                args_tail.push(linked.into_os_string());
            } else {
                args_tail.push(arg.clone());
            }
        }
        Ok(StagedEntry {
            entry_dir: entry_dir.to_path_buf(),
            exec_path,
            args_tail,
            log_egress,
        })
    }

    /// Forgets an entry and removes its staged files. Hard-linked alias
    /// files elsewhere keep their inodes.
    pub fn remove(&mut self, code_token: &str) {
        if let Some(entry) = self.entries.remove(code_token) {
            if let Err(e) = std::fs::remove_dir_all(&entry.entry_dir) {
                warn!(dir = %entry.entry_dir.display(), error = %e, "entry dir cleanup failed");
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(token: &str, content: &[u8]) -> LoadBinary {
        LoadBinary {
            request_id: 1,
            code_token: token.to_owned(),
            binary_content: content.to_vec(),
            n_workers: 1,
            enable_log_egress: false,
            source_code_token: String::new(),
            loader_kind: LoaderKind::NativeBinary as i32,
            js_source: Vec::new(),
            wasm_blob: Vec::new(),
        }
    }

    #[test]
    fn stages_native_binary_executable() {
        let base = tempfile::tempdir().unwrap();
        let mut prog = ProgramDir::create(base.path(), None).unwrap();
        let staged = prog.stage(&load("tok-a", b"#!/bin/sh\n")).unwrap();
        assert!(staged.exec_path.exists());
        let mode = std::fs::metadata(&staged.exec_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o500);
    }

    #[test]
    fn rejects_empty_binary() {
        let base = tempfile::tempdir().unwrap();
        let mut prog = ProgramDir::create(base.path(), None).unwrap();
        assert!(matches!(
            prog.stage(&load("tok-a", b"")),
            Err(StageError::EmptyPayload(LoaderKind::NativeBinary))
        ));
    }

    #[test]
    fn alias_survives_source_removal() {
        let base = tempfile::tempdir().unwrap();
        let mut prog = ProgramDir::create(base.path(), None).unwrap();
        prog.stage(&load("tok-src", b"payload")).unwrap();

        let alias = LoadBinary {
            source_code_token: "tok-src".to_owned(),
            enable_log_egress: true,
            ..load("tok-alias", b"")
        };
        let staged_path = prog.stage(&alias).unwrap().exec_path.clone();
        assert!(staged_path.exists());

        prog.remove("tok-src");
        assert!(staged_path.exists());
        assert_eq!(std::fs::read(&staged_path).unwrap(), b"payload");
    }

    #[test]
    fn alias_of_unknown_source_rejected() {
        let base = tempfile::tempdir().unwrap();
        let mut prog = ProgramDir::create(base.path(), None).unwrap();
        let alias = LoadBinary {
            source_code_token: "missing".to_owned(),
            ..load("tok-alias", b"")
        };
        assert!(matches!(
            prog.stage(&alias),
            Err(StageError::UnknownSource(_))
        ));
    }

    #[test]
    fn javascript_requires_shim() {
        let base = tempfile::tempdir().unwrap();
        let mut prog = ProgramDir::create(base.path(), None).unwrap();
        let js = LoadBinary {
            loader_kind: LoaderKind::Javascript as i32,
            js_source: b"export {}".to_vec(),
            ..load("tok-js", b"")
        };
        assert!(matches!(
            prog.stage(&js),
            Err(StageError::NoEngineShim(LoaderKind::Javascript))
        ));
    }

    #[test]
    fn javascript_staged_with_shim() {
        let base = tempfile::tempdir().unwrap();
        let shim = base.path().join("shim");
        std::fs::write(&shim, b"shim").unwrap();
        let mut prog = ProgramDir::create(base.path(), Some(shim.clone())).unwrap();
        let js = LoadBinary {
            loader_kind: LoaderKind::JavascriptWithWasm as i32,
            js_source: b"export {}".to_vec(),
            wasm_blob: b"\0asm".to_vec(),
            ..load("tok-js", b"")
        };
        let staged = prog.stage(&js).unwrap();
        assert_eq!(staged.exec_path, shim);
        assert_eq!(staged.args_tail.len(), 2);
    }

    #[test]
    fn remove_deletes_entry_dir() {
        let base = tempfile::tempdir().unwrap();
        let mut prog = ProgramDir::create(base.path(), None).unwrap();
        let dir = prog.stage(&load("tok-a", b"x")).unwrap().entry_dir.clone();
        assert!(dir.exists());
        prog.remove("tok-a");
        assert!(!dir.exists());
    }
}
