// Command module routing
//
// Each command group lives in its own file with a `Subcommand` enum and a
// `handle_*` entry point.
pub mod cluster;

pub use cluster::{decide, handle_cluster, ClusterCommands};
