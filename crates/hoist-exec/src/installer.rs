use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use hoist_core::VersionConstraint;

use crate::error::ExecError;
use crate::executor::{CommandExecutor, CommandOutput, CommandSpec, Isolation, RealExecutor};
use crate::retry::RetryPolicy;

/// Package manager families hoist knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Pip,
    Npm,
}

impl PackageManager {
    /// Detects the family from the installer program, e.g. `apt-get` or `./build/env/bin/pip`.
    pub fn detect(program: &str) -> Option<Self> {
        let name = program.rsplit('/').next().unwrap_or(program);
        if name == "apt" || name == "apt-get" {
            Some(PackageManager::Apt)
        } else if name.starts_with("pip") {
            Some(PackageManager::Pip)
        } else if name == "npm" {
            Some(PackageManager::Npm)
        } else {
            None
        }
    }

    /// Package argument in the manager's own pinning syntax, e.g. `nodejs=14.*` or `pkg==1.0`.
    pub fn package_spec(&self, name: &str, constraint: &VersionConstraint) -> String {
        match (self, constraint) {
            (_, VersionConstraint::Latest) => name.to_owned(),
            (PackageManager::Apt, VersionConstraint::Exact(v)) => format!("{name}={v}"),
            (PackageManager::Pip, VersionConstraint::Exact(v)) => format!("{name}=={v}"),
            (PackageManager::Npm, VersionConstraint::Exact(v)) => format!("{name}@{v}"),
        }
    }

    /// Arguments installing one package at the requested version.
    pub fn install_args(&self, name: &str, constraint: &VersionConstraint) -> Vec<String> {
        let spec = self.package_spec(name, constraint);
        match self {
            PackageManager::Apt => args(["install", "-y", "--no-install-recommends", &spec]),
            PackageManager::Pip => args(["install", "--no-cache-dir", &spec]),
            PackageManager::Npm => args(["install", "--global", &spec]),
        }
    }

    /// Environment the installer needs to run unattended.
    pub fn env(&self) -> BTreeMap<String, String> {
        match self {
            PackageManager::Apt => {
                BTreeMap::from([("DEBIAN_FRONTEND".to_owned(), "noninteractive".to_owned())])
            }
            PackageManager::Pip => {
                BTreeMap::from([("PIP_DISABLE_PIP_VERSION_CHECK".to_owned(), "1".to_owned())])
            }
            PackageManager::Npm => BTreeMap::new(),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageManager::Apt => "apt",
            PackageManager::Pip => "pip",
            PackageManager::Npm => "npm",
        })
    }
}

/// Output fragments that mark a failure as a network hiccup worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "Temporary failure resolving",
    "Could not resolve",
    "Connection timed out",
    "Connection reset",
    "Connection refused",
    "ReadTimeoutError",
    "Hash Sum mismatch",
    "503 Service Unavailable",
    "502 Bad Gateway",
    "ETIMEDOUT",
    "ECONNRESET",
    "EAI_AGAIN",
];

/// Whether a failed install is worth retrying.
pub fn is_transient(error: &ExecError) -> bool {
    match error {
        ExecError::CommandFailed { stderr, .. } => {
            TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker))
        }
        ExecError::NotFound { .. } | ExecError::InvalidUtf8 { .. } => false,
    }
}

/// Installs packages and runs build commands, parameterized over the executor for testability.
pub struct PackageInstaller<E: CommandExecutor = RealExecutor> {
    executor: E,
    policy: RetryPolicy,
    isolation: Isolation,
}

impl PackageInstaller<RealExecutor> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_executor(RealExecutor, policy)
    }
}

impl Default for PackageInstaller<RealExecutor> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<E: CommandExecutor> PackageInstaller<E> {
    pub fn with_executor(executor: E, policy: RetryPolicy) -> Self {
        Self {
            executor,
            policy,
            isolation: Isolation::None,
        }
    }

    /// Run package installs and commands against an isolated image root.
    pub fn isolated(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    // ── Packages ──

    /// Install one package with `program`, retrying transient failures.
    ///
    /// A definitive failure, or a transient one that outlives the retry
    /// budget, is reported as [`InstallError`] naming the package.
    pub async fn install(
        &self,
        program: &str,
        name: &str,
        constraint: &VersionConstraint,
        cwd: &Path,
    ) -> Result<(), InstallError> {
        let manager = PackageManager::detect(program).ok_or_else(|| InstallError::UnknownInstaller {
            program: program.to_owned(),
        })?;
        let command = CommandSpec::new(program)
            .args(manager.install_args(name, constraint))
            .cwd(cwd)
            .envs(&manager.env())
            .isolate(&self.isolation);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.executor.exec(&command).await {
                Ok(_) => {
                    tracing::debug!(package = name, %constraint, %manager, attempt, "package installed");
                    return Ok(());
                }
                Err(e) if is_transient(&e) && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        package = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient install failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(InstallError::RetriesExhausted {
                        package: name.to_owned(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(InstallError::Unavailable {
                        package: name.to_owned(),
                        constraint: constraint.to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    // ── Commands ──

    /// Run a shell command once. Build commands are not retried.
    pub async fn run(
        &self,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ExecError> {
        tracing::debug!(command, cwd = %cwd.display(), "running command");
        let spec = CommandSpec::shell(command)
            .cwd(cwd)
            .envs(env)
            .isolate(&self.isolation);
        self.executor.exec(&spec).await
    }

    /// Run a command that fetches from the network, retrying transient failures.
    pub async fn run_fetch(
        &self,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput, ExecError> {
        let spec = CommandSpec::shell(command)
            .cwd(cwd)
            .envs(env)
            .isolate(&self.isolation);
        self.exec_with_retry(&spec).await
    }

    /// Run a host command (no isolation) that fetches from the network, retrying transient failures.
    pub async fn fetch_on_host(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        self.exec_with_retry(command).await
    }

    async fn exec_with_retry(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.executor.exec(spec).await {
                Err(e) if is_transient(&e) && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(program = %spec.program, attempt, error = %e, "transient fetch failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    // ── Doctor ──

    /// Probe each program with `--version` without early return.
    pub async fn doctor(&self, programs: &[&str]) -> DoctorReport {
        let mut report = DoctorReport::default();
        for program in programs {
            let result = match self
                .executor
                .exec(&CommandSpec::new(*program).arg("--version"))
                .await
            {
                Ok(out) => {
                    let first = out.stdout.lines().next().unwrap_or("").trim();
                    if first.is_empty() {
                        CheckResult::ok("available")
                    } else {
                        CheckResult::ok(first)
                    }
                }
                Err(e) => CheckResult::fail(&e.to_string()),
            };
            report.tools.push(ToolCheck {
                name: (*program).to_owned(),
                result,
            });
        }
        report
    }
}

// ── Helper ──

fn args<const N: usize>(a: [&str; N]) -> Vec<String> {
    a.iter().map(|s| (*s).to_owned()).collect()
}

// ── Doctor types ──

#[derive(Debug, Default)]
pub struct DoctorReport {
    pub tools: Vec<ToolCheck>,
    pub config_file: CheckResult,
    pub platform: CheckResult,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.config_file.passed && self.platform.passed && self.tools.iter().all(|t| t.result.passed)
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] config    {}", self.config_file.icon(), self.config_file.detail)?;
        writeln!(f, "[{}] platform  {}", self.platform.icon(), self.platform.detail)?;
        for tool in &self.tools {
            writeln!(f, "[{}] {:<9} {}", tool.result.icon(), tool.name, tool.result.detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn ok(detail: &str) -> Self {
        Self {
            passed: true,
            detail: detail.to_owned(),
        }
    }

    pub fn fail(detail: &str) -> Self {
        Self {
            passed: false,
            detail: detail.to_owned(),
        }
    }

    pub fn icon(&self) -> &'static str {
        if self.passed { "OK" } else { "NG" }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub name: String,
    pub result: CheckResult,
}

// ── Error types ──

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("no package manager known for installer '{program}'")]
    UnknownInstaller { program: String },

    #[error("package '{package}' ({constraint}) could not be installed")]
    Unavailable {
        package: String,
        constraint: String,
        source: ExecError,
    },

    #[error("package '{package}' failed after {attempts} attempts")]
    RetriesExhausted {
        package: String,
        attempts: u32,
        source: ExecError,
    },
}

impl InstallError {
    /// The package that failed, when the failure is package-specific.
    pub fn package(&self) -> Option<&str> {
        match self {
            InstallError::UnknownInstaller { .. } => None,
            InstallError::Unavailable { package, .. }
            | InstallError::RetriesExhausted { package, .. } => Some(package),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_manager_from_program_path() {
        assert_eq!(PackageManager::detect("apt-get"), Some(PackageManager::Apt));
        assert_eq!(
            PackageManager::detect("./build/env/bin/pip"),
            Some(PackageManager::Pip)
        );
        assert_eq!(PackageManager::detect("pip3"), Some(PackageManager::Pip));
        assert_eq!(PackageManager::detect("/usr/bin/npm"), Some(PackageManager::Npm));
        assert_eq!(PackageManager::detect("yum"), None);
    }

    #[test]
    fn install_args_format_versions_per_manager() {
        let exact = VersionConstraint::Exact("1.0".to_owned());
        assert_eq!(
            PackageManager::Apt.install_args("gcc", &exact),
            vec!["install", "-y", "--no-install-recommends", "gcc=1.0"]
        );
        assert_eq!(
            PackageManager::Pip.install_args("connector-a", &exact),
            vec!["install", "--no-cache-dir", "connector-a==1.0"]
        );
        assert_eq!(
            PackageManager::Npm.install_args("yarn", &VersionConstraint::Latest),
            vec!["install", "--global", "yarn"]
        );
    }

    #[test]
    fn transient_classification() {
        let transient = ExecError::CommandFailed {
            program: "apt-get".to_owned(),
            args: vec![],
            status: Some(100),
            stderr: "Temporary failure resolving 'archive.ubuntu.com'".to_owned(),
        };
        let definitive = ExecError::CommandFailed {
            program: "apt-get".to_owned(),
            args: vec![],
            status: Some(100),
            stderr: "E: Unable to locate package nosuch".to_owned(),
        };
        assert!(is_transient(&transient));
        assert!(!is_transient(&definitive));
    }
}
