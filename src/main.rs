fn main() -> std::process::ExitCode {
    bracket_seed_resolver_lib::run()
}
