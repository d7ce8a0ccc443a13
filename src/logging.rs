use colored::*;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// PE number used as the diagnostic prefix; 0 until sync has assigned one.
static CURRENT_PE: AtomicU32 = AtomicU32::new(0);

/// Record this process's PE number for the `[PE n]` prefix. Called once
/// after sync.
pub fn set_pe(pe: u32) {
    CURRENT_PE.store(pe, Ordering::Release);
}

pub fn current_pe() -> u32 {
    CURRENT_PE.load(Ordering::Acquire)
}

/// A tracing event formatter that prefixes every line with the PE number
/// and colors the line by severity.
///
/// Diagnostics of a whole cohort usually end up interleaved on one
/// terminal; the `[PE n]` prefix keeps every line attributable.
pub struct PePrefixFormatter;

impl<S, N> FormatEvent<S, N> for PePrefixFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let pe = current_pe();
        let line = if pe == 0 {
            buffer
        } else {
            format!("[PE {}] {}", pe, buffer)
        };

        let colored_output = match *event.metadata().level() {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}
