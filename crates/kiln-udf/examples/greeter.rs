//! Minimal native UDF binary: one greeting handler plus an echo.
//!
//! Build it and hand the resulting binary to `Dispatcher::load`; the
//! runner execs it inside the sandbox with the socket fd as its sole
//! argument.

use std::process::ExitCode;

use kiln_udf::{HostPort, Invocation, Severity, UdfError, UdfHandler, serve_from_args};

struct Greeter;

impl UdfHandler for Greeter {
    fn handle(
        &mut self,
        invocation: &Invocation<'_>,
        host: &mut HostPort<'_>,
    ) -> Result<Vec<u8>, UdfError> {
        match invocation.handler_name {
            "Sample" => {
                let _ = host.log(Severity::Info, "greeting requested");
                Ok(b"\"Hello, world!\"".to_vec())
            }
            "Echo" => Ok(invocation.inputs.first().cloned().unwrap_or_default()),
            other => Err(UdfError::NoSuchHandler(other.to_owned())),
        }
    }
}

fn main() -> ExitCode {
    serve_from_args(Greeter)
}
