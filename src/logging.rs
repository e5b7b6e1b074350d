use tracing_subscriber::{
    filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

/// Traffic logging is channel-tagged rather than span-wrapped: every
/// event targets the crate name and carries a `channel` field naming
/// the direction, so `POSTGATE_LOG=postgate=trace` shows the whole
/// conversation and filters stay cheap.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::tracing::event!(
            target: env!("CARGO_PKG_NAME"),
            $crate::tracing::Level::$level,
            channel = "incoming",
            $($arg)*
        )
    };

    ($($arg:tt)*) => {
        $crate::incoming!(level = TRACE, $($arg)*)
    };
}

#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::tracing::event!(
            target: env!("CARGO_PKG_NAME"),
            $crate::tracing::Level::$level,
            channel = "outgoing",
            $($arg)*
        )
    };

    ($($arg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($arg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)*) => {
        $crate::tracing::event!(
            target: env!("CARGO_PKG_NAME"),
            $crate::tracing::Level::$level,
            channel = "internal",
            $($arg)*
        )
    };

    ($($arg:tt)*) => {
        $crate::internal!(level = TRACE, $($arg)*)
    };
}

/// Install the global subscriber. `POSTGATE_LOG` overrides the level the
/// same way `RUST_LOG` would; `-d` on the command line raises the default
/// to TRACE.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_env("POSTGATE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if debug { "postgate=trace" } else { "postgate=info" })
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_filter(filter),
        )
        .init();
}
