fn main() {
    if let Err(err) = opengui_host::cli::run() {
        eprintln!("opengui: {err}");
        std::process::exit(1);
    }
}
