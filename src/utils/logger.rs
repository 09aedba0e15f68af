use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

/// Install the process-wide logger. `RUST_LOG` still overrides the level.
pub fn setup_logging() {
    let mut builder = Builder::new();

    builder
        .target(Target::Stdout)
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    // A second call (tests, embedding apps) keeps the first logger.
    let _ = builder.try_init();
}
