//! Standalone inspection binary: the read-only command set over an
//! existing datastore, with no flows registered. `run`/`resume` report
//! an error pointing at the flow binary.

use metaflow_lite_core::flow::FlowRegistry;
use std::process::ExitCode;

fn main() -> ExitCode {
    metaflow_lite_cli::main_with_registry(FlowRegistry::new())
}
