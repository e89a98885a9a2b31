pub mod error;
pub mod executor;
pub mod installer;
pub mod retry;

pub use error::ExecError;
pub use executor::{CommandExecutor, CommandOutput, CommandSpec, Isolation, RealExecutor};
pub use installer::{
    CheckResult, DoctorReport, InstallError, PackageInstaller, PackageManager, ToolCheck,
};
pub use retry::RetryPolicy;
