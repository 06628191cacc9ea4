/**
 * @module logging
 * @description Custom logging configuration for clean console output
 *
 * This module provides a custom tracing formatter that improves log
 * readability by conditionally displaying file location information. The
 * goal is to reduce visual noise in the console while preserving critical
 * debugging information for errors.
 *
 * ## ConditionalLocationFormatter
 *
 * A custom FormatEvent implementation that:
 * - Shows file:line for ERROR and WARN levels only
 * - Omits location information for INFO, DEBUG, and TRACE
 * - Preserves all other formatting (levels, spans, messages)
 *
 * Example output:
 * ```text
 * ERROR shopfloor::saga:182: Failed to roll back stock for item 7f3a...
 * INFO  shopfloor: 🚀 Gateway listening on 127.0.0.1:8000
 * ```
 *
 * ## Usage
 *
 * The formatter is applied by `init_logging()` in main.rs. It integrates
 * with the tracing ecosystem and respects RUST_LOG environment variable
 * settings. sled's verbose internals are suppressed to warn.
 */

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Custom formatter that conditionally shows file:line only for ERROR and WARN levels
pub struct ConditionalLocationFormatter;

impl<S, N> FormatEvent<S, N> for ConditionalLocationFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();

        // Format level
        write!(&mut writer, "{}", level)?;

        // Only show module target and file:line for ERROR and WARN levels
        if matches!(level, &Level::ERROR | &Level::WARN) {
            write!(&mut writer, " {}", metadata.target())?;
            if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
                write!(&mut writer, " {}:{}", file, line)?;
            }
        }

        write!(&mut writer, ": ")?;

        // Format all the spans in the event's span context
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(&mut writer, ":")?;
                }
                first = false;
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
            write!(writer, " ")?;
        }

        // Write the event fields
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Build the env filter with sled's debug output suppressed.
pub fn create_base_env_filter(default_level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    // Suppress sled's verbose debug output
    for directive in ["sled=warn", "pagecache=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize the tracing subscriber with custom formatting
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(create_base_env_filter("info"))
        .event_format(ConditionalLocationFormatter)
        .init();
}
