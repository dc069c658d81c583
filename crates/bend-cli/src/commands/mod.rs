//! Command implementations for the CLI.

mod info;
mod scan;
mod stream;

pub use info::cmd_info;
pub use scan::cmd_scan;
pub use stream::{StreamArgs, cmd_stream};
