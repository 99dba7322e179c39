use std::process::ExitCode;

fn main() -> ExitCode {
    sprout_cli::run()
}
