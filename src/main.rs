fn main() {
    let args = std::env::args();
    // Initialize logging as early as possible; fallback to stderr on failure.
    let _ = hotbak::logging::init_logging(hotbak::logging::LogFormat::Human);

    if let Err(err) = hotbak::run(args) {
        eprintln!("hotbak error: {err}");
        std::process::exit(1);
    }
}
