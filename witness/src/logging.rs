//! Construction of the `tracing` subscribers used by the binary.

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

/// Filter used before the configuration is loaded: `RUST_LOG` if set, otherwise `info`.
pub fn bootstrap_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// A fmt subscriber with line numbers and no ANSI colours, in JSON if `json` is set.
pub fn subscriber<W>(filter: EnvFilter, json: bool, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);
    if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use std::{io, path::Path, sync::Arc};

    use parking_lot::Mutex;

    use super::*;
    use crate::cfg::Config;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn configuration_warnings_reach_the_bootstrap_subscriber() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = subscriber(EnvFilter::new("warn"), false, move || writer.clone());

        tracing::subscriber::with_default(subscriber, || {
            let mut config = Config::load(Path::new("/nonexistent/witness.toml")).unwrap();
            config
                .apply_overrides(|name| (name == "SERVER_QUEUE_PERIOD").then(|| "7".to_owned()))
                .unwrap();
            assert_eq!(config.server.queue_period, 7);
        });

        let logs = captured.text();
        assert!(logs.contains("config file not found"), "{logs}");
        assert!(logs.contains("applying numeric environment override"), "{logs}");
        assert!(logs.contains("SERVER_QUEUE_PERIOD"), "{logs}");
    }

    #[test]
    fn json_output_is_selectable() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = subscriber(EnvFilter::new("info"), true, move || writer.clone());

        tracing::subscriber::with_default(subscriber, || tracing::info!(chain_id = 3, "hello"));

        let line = captured.text();
        let event: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(event["fields"]["message"], "hello");
        assert_eq!(event["fields"]["chain_id"], 3);
    }
}
