//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call [`init_journald_or_stdout`] to install
//! a tracing subscriber. The rest of the program can `use
//! crate::tracing::prelude::*` for the `trace!()` through `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout();
    }
}

// Log to stdout, filtering according to RUST_LOG and defaulting to INFO.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .event_format(CompactFormatter),
        )
        .init();
}

/// Event formatter that strips our crate prefix from the target and puts
/// structured fields on a dimmed second line.
struct CompactFormatter;

#[derive(Default)]
struct FieldCollector {
    fields: Vec<(String, String)>,
    message: Option<String>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name().to_string(), formatted));
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CompactFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let (level_color, level_text) = match *event.metadata().level() {
            tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
            tracing::Level::WARN => ("\x1b[33m", "WARN "),
            tracing::Level::INFO => ("\x1b[32m", "INFO "),
            tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
            tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(writer, "{}{}\x1b[0m ", level_color, level_text)?;

        let target = event.metadata().target();
        let short_target = target.strip_prefix("mujina_bitfury::").unwrap_or(target);
        write!(writer, "{}: ", short_target)?;

        if let Some(ref msg) = visitor.message {
            write!(writer, "{}", msg.trim_matches('"'))?;
        }

        if !visitor.fields.is_empty() {
            // Indent past "HH:MM:SS LEVEL "
            write!(writer, "\n\x1b[90m               ")?;
            for (i, (key, value)) in visitor.fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value.trim_matches('"'))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

// Local time, to the nearest second. The default timer is UTC and verbose.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
