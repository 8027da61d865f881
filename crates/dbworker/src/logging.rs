//! Subscriber setup for executables embedding dbworker.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `DBWORKER_LOG` picks the level for this
/// crate (default `info`). `LOG_FORMAT=json` switches to JSON lines. Stdout is
/// left alone. Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!("dbworker={}", level_from(std::env::var("DBWORKER_LOG").ok())))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn level_from(value: Option<String>) -> &'static str {
    match value.as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(level_from(None), "info");
        assert_eq!(level_from(Some("warning".into())), "warn");
        assert_eq!(level_from(Some("trace".into())), "trace");
        assert_eq!(level_from(Some("loud".into())), "info");
    }
}
