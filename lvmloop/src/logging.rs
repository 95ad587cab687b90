use std::path::Path;

/// Level for a `-v` count; `RUST_LOG` still overrides it.
pub fn level_for(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

pub fn init(verbosity: u8, log_file: Option<&Path>) {
    use env_logger::Target;
    use std::fs;
    use std::io;

    // If the log file cannot be opened (permissions, readonly FS), fall back to stderr.
    let target = log_file
        .map(|path| -> io::Result<Target> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(Target::Pipe(Box::new(file)))
        })
        .and_then(|result| result.ok())
        .unwrap_or(Target::Stderr);

    let _ = env_logger::Builder::new()
        .filter_level(level_for(verbosity))
        .parse_default_env()
        .target(target)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_level() {
        assert_eq!(level_for(0), log::LevelFilter::Info);
        assert_eq!(level_for(1), log::LevelFilter::Debug);
        assert_eq!(level_for(5), log::LevelFilter::Trace);
    }
}
