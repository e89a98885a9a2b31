use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use hoist_core::VersionConstraint;
use hoist_exec::error::ExecError;
use hoist_exec::executor::{CommandExecutor, CommandOutput, CommandSpec};
use hoist_exec::installer::{InstallError, PackageInstaller};
use hoist_exec::retry::RetryPolicy;
use mockall::mock;

mock! {
    Executor {}

    impl CommandExecutor for Executor {
        async fn exec(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1))
}

fn failed(stderr: &str, status: i32) -> ExecError {
    ExecError::CommandFailed {
        program: "pip".to_owned(),
        args: vec![],
        status: Some(status),
        stderr: stderr.to_owned(),
    }
}

// ── Install Tests ──

#[tokio::test]
async fn install_passes_versioned_spec_and_cwd() {
    let mut mock = MockExecutor::new();
    mock.expect_exec()
        .withf(|cmd| {
            cmd.program == "./build/env/bin/pip"
                && cmd.args.contains(&"connector-a==1.0".to_owned())
                && cmd.cwd.as_deref() == Some(Path::new("/usr/share/hue"))
        })
        .times(1)
        .returning(|_| Ok(CommandOutput::default()));

    let installer = PackageInstaller::with_executor(mock, policy(3));
    installer
        .install(
            "./build/env/bin/pip",
            "connector-a",
            &VersionConstraint::Exact("1.0".to_owned()),
            Path::new("/usr/share/hue"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn apt_install_runs_noninteractive() {
    let mut mock = MockExecutor::new();
    mock.expect_exec()
        .withf(|cmd| {
            cmd.program == "apt-get"
                && cmd.env.get("DEBIAN_FRONTEND").map(String::as_str) == Some("noninteractive")
        })
        .times(1)
        .returning(|_| Ok(CommandOutput::default()));

    let installer = PackageInstaller::with_executor(mock, policy(1));
    installer
        .install("apt-get", "git", &VersionConstraint::Latest, Path::new("/"))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_then_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut mock = MockExecutor::new();
    mock.expect_exec().times(3).returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(failed("ReadTimeoutError: HTTPSConnectionPool", 1))
        } else {
            Ok(CommandOutput::default())
        }
    });

    let installer = PackageInstaller::with_executor(mock, policy(3));
    installer
        .install("pip", "connector-a", &VersionConstraint::Latest, Path::new("/"))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_exhausts_retry_budget() {
    let mut mock = MockExecutor::new();
    mock.expect_exec()
        .times(3)
        .returning(|_| Err(failed("Could not resolve host: pypi.org", 1)));

    let installer = PackageInstaller::with_executor(mock, policy(3));
    let err = installer
        .install("pip", "connector-a", &VersionConstraint::Latest, Path::new("/"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InstallError::RetriesExhausted { ref package, attempts: 3, .. } if package == "connector-a"
    ));
}

#[tokio::test]
async fn definitive_failure_is_not_retried() {
    let mut mock = MockExecutor::new();
    mock.expect_exec().times(1).returning(|_| {
        Err(failed(
            "ERROR: No matching distribution found for connector-b==bad-version",
            1,
        ))
    });

    let installer = PackageInstaller::with_executor(mock, policy(5));
    let err = installer
        .install(
            "pip",
            "connector-b",
            &VersionConstraint::Exact("bad-version".to_owned()),
            Path::new("/"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.package(), Some("connector-b"));
    assert!(err.to_string().contains("connector-b"));
    assert!(err.to_string().contains("bad-version"));
}

#[tokio::test]
async fn unknown_installer_is_rejected_without_exec() {
    let mut mock = MockExecutor::new();
    mock.expect_exec().times(0);

    let installer = PackageInstaller::with_executor(mock, policy(1));
    let err = installer
        .install("yum", "git", &VersionConstraint::Latest, Path::new("/"))
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::UnknownInstaller { .. }));
}

// ── Run Tests ──

#[tokio::test]
async fn run_is_not_retried() {
    let mut mock = MockExecutor::new();
    mock.expect_exec()
        .withf(|cmd| cmd.program == "sh" && cmd.args == ["-c", "make apps"])
        .times(1)
        .returning(|_| Err(failed("Connection reset by peer", 2)));

    let installer = PackageInstaller::with_executor(mock, policy(3));
    let err = installer
        .run("make apps", Path::new("/usr/share/hue"), &BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.exit_status(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn run_fetch_retries_transient_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let mut mock = MockExecutor::new();
    mock.expect_exec().times(2).returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(failed("curl: (6) Could not resolve host", 6))
        } else {
            Ok(CommandOutput {
                stdout: "ok\n".to_owned(),
                stderr: String::new(),
            })
        }
    });

    let installer = PackageInstaller::with_executor(mock, policy(3));
    let out = installer
        .run_fetch("curl -fsSL https://example.invalid | bash -", Path::new("/"), &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(out.stdout, "ok\n");
}

// ── Doctor Tests ──

#[tokio::test]
async fn doctor_reports_each_tool() {
    let mut mock = MockExecutor::new();
    mock.expect_exec()
        .withf(|cmd| cmd.program == "git")
        .returning(|_| {
            Ok(CommandOutput {
                stdout: "git version 2.43.0\n".to_owned(),
                stderr: String::new(),
            })
        });
    mock.expect_exec()
        .withf(|cmd| cmd.program == "apt-get")
        .returning(|cmd| {
            Err(ExecError::NotFound {
                program: cmd.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            })
        });

    let installer = PackageInstaller::with_executor(mock, policy(1));
    let report = installer.doctor(&["git", "apt-get"]).await;

    assert_eq!(report.tools.len(), 2);
    assert!(report.tools[0].result.passed);
    assert_eq!(report.tools[0].result.detail, "git version 2.43.0");
    assert!(!report.tools[1].result.passed);
    assert!(!report.all_passed());
    assert!(report.to_string().contains("[NG] apt-get"));
}
