use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Install the global subscriber. `RUST_LOG` overrides, `directives` are always added.
pub fn init(format: LogFormat, directives: &[&str]) -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for directive in directives {
        filter = filter.add_directive(directive.parse()?);
    }

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    Ok(())
}
