fn main() {
    if let Err(err) = codex_provider::cli::run_codex_provider() {
        codex_provider::cli::report_error(&err);
        std::process::exit(1);
    }
}
