//! Tracing output format for the extension.
//!
//! Lines carry a fixed prefix so the extension's output can be told apart
//! from function output in the shared CloudWatch log stream. The span scope
//! is rendered as one dotted path with the span fields in brackets:
//!
//! ```text
//! APM_EXTENSION | INFO | Waiting for next event...
//! APM_EXTENSION | ERROR | invocation[request_id=6f7f0961]: APM server returned status 503
//! ```

use std::fmt::{self, Write as _};

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

/// Event formatter producing `<prefix> | LEVEL | scope: message` lines.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    prefix: &'static str,
}

impl Formatter {
    /// A formatter tagging every line with the given prefix.
    #[must_use]
    pub const fn with_prefix(prefix: &'static str) -> Self {
        Self { prefix }
    }

    /// The active span scope as `root[fields].child[fields]`, or `None`
    /// outside of any span.
    fn scope_path<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        N: for<'a> FormatFields<'a> + 'static,
    {
        let scope = ctx.event_scope()?;
        let mut path = String::new();
        for span in scope.from_root() {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(span.name());
            let ext = span.extensions();
            if let Some(fields) = ext.get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    let _ = write!(path, "[{fields}]");
                }
            }
        }
        (!path.is_empty()).then_some(path)
    }
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "{} | {} | ",
            self.prefix,
            event.metadata().level()
        )?;
        if let Some(path) = Self::scope_path(ctx) {
            write!(writer, "{path}: ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
