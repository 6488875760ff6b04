// Tracing setup for hosts embedding the lobby client.

use anyhow::Context;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "partysheet_core=info,partysheet_client=info,warn";

/// The filter `init_tracing` installs: `RUST_LOG` if it parses, otherwise
/// [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a global fmt subscriber writing to `writer`.
///
/// Hosts with a terminal UI should pass a file so log lines never land on
/// the rendered screen.
pub fn init_tracing<W>(writer: W) -> anyhow::Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER).unwrap();
        assert!(filter.to_string().contains("partysheet_client=info"));
    }

    #[test]
    fn second_install_is_an_error() {
        // Whichever install runs first in this process may succeed; a second
        // one never can.
        let _ = init_tracing(std::io::sink);
        assert!(init_tracing(std::io::sink).is_err());
    }
}
