//! Build servers: runtime, wire protocol, client-side lifecycle, auto-start.

pub mod autostart;
mod error;
pub mod exec;
pub mod lifecycle;
pub mod log_rotation;
pub mod protocol;
mod remote;
mod runtime;
pub mod supervisor;

pub use error::DaemonError;
pub use exec::run_in_process;
pub use lifecycle::{Probe, StartOutcome, StopOutcome};
pub use protocol::{
    execute, ping, request_reset, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse, ExecOutcome, ExecTimeouts, ExecuteRequest, OutputStream, PingInfo, StatusInfo,
};
pub use remote::RemoteCompiler;
pub use runtime::{init_tracing, run, start_blocking, Shutdown, VERSION};
pub use supervisor::ExitDeadline;
