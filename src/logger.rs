use std::io::Write;

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;

/// Timestamped stderr logging at Info; `RUST_LOG` overrides the level.
pub fn init() {
    let result = Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .filter(Some("actix_server"), LevelFilter::Warn)
        .parse_default_env()
        .try_init();

    if result.is_ok() {
        log::info!("Logger initialized.");
    }
}
