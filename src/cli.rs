//! # Command-Line Interface Module
//!
//! Argument parsing for the cohort driver binary, built on the `clap`
//! derive API. The options mirror the runtime flags the parallel core
//! recognises: the transport backend, the pack buffer and send buffer
//! sizes, the two placement bits, and per-subsystem debug toggles.
//!
//! The PE count travels as the first free argument — injected by whatever
//! launches the cohort — and is consumed again by the transport during
//! startup, before any other argument handling. `clap` sees it as an
//! optional positional so that `--help` output stays truthful.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Four PEs over the TCP mesh backend
//! par-runtime 4
//!
//! # Spawned processes with Unix-socket inboxes, verbose comm tracing
//! par-runtime 4 --backend spawn --debug comm
//!
//! # Random placement, never local, smaller pack buffer
//! par-runtime 8 --random-placement --no-local-placement \
//!     --pack-buffer-size 1048576
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use tracing_subscriber::filter::LevelFilter;

use crate::mp::MpBackend;
use crate::runtime::{Placement, RtsConfig};

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Subsystems with their own debug verbosity toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugFlag {
    /// Message-passing layer and backends.
    Comm,
    /// Graph packing and unpacking.
    Pack,
    /// Individual message traffic.
    Packet,
    /// Process creation and placement.
    Procs,
    /// Port and inport bookkeeping.
    Ports,
}

impl DebugFlag {
    /// The tracing target this flag opens up.
    fn target(self) -> &'static str {
        match self {
            DebugFlag::Comm => "par_runtime::comm",
            DebugFlag::Pack => "par_runtime::pack",
            DebugFlag::Packet => "par_runtime::packet",
            DebugFlag::Procs => "par_runtime::procs",
            DebugFlag::Ports => "par_runtime::ports",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Number of PEs to run (0 or absent: one per CPU)
    ///
    /// Injected as the first argument by the launching side and consumed
    /// by the transport during startup. Spawning backends start this many
    /// processes; externally launched cohorts must match it.
    pub pes: Option<u32>,

    /// Message-passing backend carrying the cohort's traffic
    #[arg(short = 'b', long, value_enum, default_value_t = MpBackend::Tcp, help_heading = "Core Options")]
    pub backend: MpBackend,

    /// Pack buffer size in bytes
    ///
    /// Bounds the payload of a single message; a graph that does not fit
    /// is a fatal error on the sender.
    #[arg(long, default_value_t = crate::defaults::PACK_BUFFER_SIZE, help_heading = "Core Options")]
    pub pack_buffer_size: usize,

    /// Transport outbox depth
    ///
    /// Number of outstanding sends per peer before `send` reports
    /// back-pressure (mailbox depth on the mbox backend).
    #[arg(long, default_value_t = crate::defaults::SEND_BUFFER_SIZE, help_heading = "Core Options")]
    pub send_buffer_size: usize,

    /// Place remote forks on uniformly random PEs
    #[arg(long, help_heading = "Placement")]
    pub random_placement: bool,

    /// Never place a remote fork on the PE that issued it
    #[arg(long, help_heading = "Placement")]
    pub no_local_placement: bool,

    /// Host address of the tcp backend's mesh
    #[arg(long, default_value = "127.0.0.1", help_heading = "Transport")]
    pub host: String,

    /// Base port of the tcp backend; PE i listens on base + i
    #[arg(long, default_value_t = crate::defaults::BASE_PORT, help_heading = "Transport")]
    pub base_port: u16,

    /// Remote tasks the demonstration driver forks (default: one per PE)
    #[arg(long, help_heading = "Driver")]
    pub tasks: Option<u32>,

    /// Subsystems to trace in detail (comm, pack, packet, procs, ports)
    #[arg(long, value_enum, num_args = 1.., help_heading = "Output and Logging")]
    pub debug: Vec<DebugFlag>,

    /// Also write diagnostics to a rolling daily log file
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence informational output
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    /// Fold the parsed options into the runtime configuration record.
    pub fn to_config(&self) -> RtsConfig {
        RtsConfig {
            backend: self.backend,
            pack_buffer_size: self.pack_buffer_size,
            send_buffer_size: self.send_buffer_size,
            placement: Placement {
                random: self.random_placement,
                no_local: self.no_local_placement,
            },
            host: self.host.clone(),
            base_port: self.base_port,
        }
    }

    /// Build the tracing filter directives from verbosity and the
    /// per-subsystem debug flags.
    pub fn filter_directives(&self) -> String {
        let base = if self.quiet {
            LevelFilter::WARN
        } else {
            match self.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        };
        let mut directives = format!("{}", base);
        for flag in &self.debug {
            directives.push_str(&format!(",{}=trace", flag.target()));
        }
        directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_runtime_options() {
        let args = Args::parse_from(["par-runtime", "4"]);
        assert_eq!(args.pes, Some(4));
        assert_eq!(args.backend, MpBackend::Tcp);
        assert_eq!(args.pack_buffer_size, crate::defaults::PACK_BUFFER_SIZE);
        assert_eq!(args.send_buffer_size, crate::defaults::SEND_BUFFER_SIZE);
        assert!(!args.random_placement);
        assert!(!args.no_local_placement);
    }

    #[test]
    fn placement_bits_map_to_config() {
        let args = Args::parse_from([
            "par-runtime",
            "3",
            "--random-placement",
            "--no-local-placement",
        ]);
        let config = args.to_config();
        assert!(config.placement.random);
        assert!(config.placement.no_local);
    }

    #[test]
    fn debug_flags_open_their_targets() {
        let args = Args::parse_from(["par-runtime", "2", "--debug", "comm", "ports", "-v"]);
        let directives = args.filter_directives();
        assert!(directives.starts_with("debug"));
        assert!(directives.contains("par_runtime::comm=trace"));
        assert!(directives.contains("par_runtime::ports=trace"));
    }

    #[test]
    fn pe_count_may_be_absent() {
        let args = Args::parse_from(["par-runtime", "--backend", "spawn"]);
        assert_eq!(args.pes, None);
        assert_eq!(args.backend, MpBackend::Spawn);
    }
}
