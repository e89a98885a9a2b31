#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hoist_build::backend::{BackendError, StageBackend};
use hoist_build::snapshot::{Changes, Entry, SnapshotDelta};
use hoist_core::VersionConstraint;
use hoist_exec::error::ExecError;
use hoist_exec::installer::InstallError;

/// In-memory backend: records every call and reports the changes a real
/// backend would have observed.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<String>>,
    pending: Mutex<Changes>,
    failing: BTreeSet<String>,
    failing_commands: BTreeSet<String>,
    outputs: BTreeMap<String, Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// `package` is reported as unavailable by its installer.
    pub fn failing_package(mut self, package: &str) -> Self {
        self.failing.insert(package.to_owned());
        self
    }

    /// `command` exits with status 2.
    pub fn failing_command(mut self, command: &str) -> Self {
        self.failing_commands.insert(command.to_owned());
        self
    }

    /// Running `command` creates the given image files.
    pub fn producing(mut self, command: &str, files: &[&str]) -> Self {
        self.outputs.insert(
            command.to_owned(),
            files.iter().map(|f| (*f).to_owned()).collect(),
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn add(&self, path: String, entry: Entry) {
        self.pending.lock().unwrap().added.insert(path, entry);
    }
}

impl StageBackend for FakeBackend {
    async fn prepare(&self) -> Result<(), BackendError> {
        self.record("prepare".to_owned());
        Ok(())
    }

    async fn install(
        &self,
        _installer: &str,
        package: &str,
        constraint: &VersionConstraint,
        _workdir: &str,
    ) -> Result<(), BackendError> {
        self.record(format!("install {package}"));
        if self.failing.contains(package) {
            return Err(BackendError::Install(InstallError::Unavailable {
                package: package.to_owned(),
                constraint: constraint.to_string(),
                source: ExecError::CommandFailed {
                    program: "pip".to_owned(),
                    args: vec!["install".to_owned(), package.to_owned()],
                    status: Some(1),
                    stderr: format!("No matching distribution found for {package}"),
                },
            }));
        }
        Ok(())
    }

    async fn run(
        &self,
        command: &str,
        workdir: &str,
        _env: &BTreeMap<String, String>,
        _fetch: bool,
    ) -> Result<(), BackendError> {
        self.record(format!("run {command}"));
        if self.failing_commands.contains(command) {
            return Err(BackendError::Command {
                command: command.to_owned(),
                source: ExecError::CommandFailed {
                    program: "/bin/sh".to_owned(),
                    args: vec!["-c".to_owned(), command.to_owned()],
                    status: Some(2),
                    stderr: "make: *** [apps] Error 2".to_owned(),
                },
            });
        }
        for file in self.outputs.get(command).into_iter().flatten() {
            let path = hoist_core::stage::normalize_path(workdir, file);
            self.add(path, Entry::file(format!("out:{command}")));
        }
        Ok(())
    }

    async fn copy(&self, files: &[(PathBuf, String)]) -> Result<(), BackendError> {
        self.record(format!("copy {}", files.len()));
        for (host, image) in files {
            let content = std::fs::read_to_string(host).unwrap();
            self.add(image.clone(), Entry::file(content));
        }
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        self.record(format!("remove {path}"));
        self.pending.lock().unwrap().removed.push(path.to_owned());
        Ok(())
    }

    async fn create_user(&self, name: &str, uid: u32, _home: &str) -> Result<(), BackendError> {
        self.record(format!("create_user {name} {uid}"));
        Ok(())
    }

    async fn changes(&self) -> Result<Changes, BackendError> {
        Ok(std::mem::take(&mut *self.pending.lock().unwrap()))
    }

    async fn commit(&self, _delta: &SnapshotDelta) -> Result<(), BackendError> {
        self.record("commit".to_owned());
        Ok(())
    }

    async fn replay(&self, _delta: &SnapshotDelta) -> Result<(), BackendError> {
        self.record("replay".to_owned());
        Ok(())
    }
}

/// A small project: a source tree with a Makefile, a startup script and
/// production configuration.
pub fn write_project(dir: &Path) {
    std::fs::create_dir_all(dir.join("apps")).unwrap();
    std::fs::create_dir_all(dir.join("conf/prod")).unwrap();
    std::fs::write(dir.join("apps/Makefile"), "apps:\n\tpython3.8 setup.py build\n").unwrap();
    std::fs::write(dir.join("package.json"), "{\"name\": \"hue\"}\n").unwrap();
    std::fs::write(dir.join("startup.sh"), "#!/bin/sh\nexec ./build/env/bin/hue runserver\n")
        .unwrap();
    std::fs::write(dir.join("conf/prod/hue.ini"), "[desktop]\nhttp_port=8888\n").unwrap();
}

pub const HOIST_TOML: &str = r#"
[platform]
target = "ubuntu-18.04"

[plugins]
connector-a = "1.0"
connector-b = "2.1"

[runtime]
config_dir = "conf/prod"
startup_script = "startup.sh"
"#;

/// Files `make apps` leaves behind in the app directory.
pub const BUILD_OUTPUTS: &[&str] = &[
    "build/env/bin/python",
    "build/env/bin/pip",
    "node_modules/webpack/index.js",
];
