fn main() {
    if let Err(err) = tripwise_lib::run() {
        log::error!("tripwise failed: {err:#}");
        eprintln!("tripwise failed: {err:#}");
        std::process::exit(1);
    }
}
